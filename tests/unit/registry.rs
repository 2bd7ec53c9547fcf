//! Registry credentials and the high availability condition

use installation_operator::controller::registry::{S3Credentials, ha_condition};

#[test]
fn test_ha_condition_reasons() {
    assert_eq!(ha_condition(false, true, true, true).1, "HANotEnabled");
    assert_eq!(ha_condition(true, true, false, true).1, "SeaweedFSNotReady");
    assert_eq!(ha_condition(true, true, true, false).1, "RegistryNotReady");
    assert_eq!(ha_condition(true, true, true, true), (true, "HAReady", "High availability is ready"));
}

#[test]
fn test_online_ha_needs_no_object_store() {
    let (ready, reason, _) = ha_condition(true, false, false, false);
    assert!(ready);
    assert_eq!(reason, "HAReady");
}

#[test]
fn test_generated_credentials() {
    let a = S3Credentials::generate();
    let b = S3Credentials::generate();

    assert_eq!(a.access_key.len(), 20);
    assert_eq!(a.secret_key.len(), 40);
    assert!(a.secret_key.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(a, b);
}

#[test]
fn test_seaweedfs_identity_document() {
    let credentials = S3Credentials {
        access_key: "AKIA".to_string(),
        secret_key: "secret".to_string(),
    };

    let document: serde_json::Value =
        serde_json::from_str(&credentials.seaweedfs_config().unwrap()).unwrap();

    let identity = &document["identities"][0];
    assert_eq!(identity["credentials"][0]["accessKey"], "AKIA");
    assert_eq!(identity["credentials"][0]["secretKey"], "secret");
    assert!(identity["actions"].as_array().unwrap().contains(&serde_json::json!("Write")));
}
