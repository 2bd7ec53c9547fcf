//! Registry and object store prerequisites
//!
//! Airgapped clusters serve images from an in-cluster registry. In HA mode the
//! registry stores blobs in the replicated object store, which needs a shared
//! set of S3 credentials generated once per cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::Client;
use rand::Rng;
use tracing::info;

use crate::addons::{Addon, REGISTRY_NAMESPACE, SEAWEEDFS_NAMESPACE, SEAWEEDFS_S3_SECRET};
use crate::controller::error::{Error, Result};
use crate::controller::status::ConditionBuilder;
use crate::crd::InstallationStatus;

/// Secret the object store reads its identities from
pub const SEAWEEDFS_CONFIG_SECRET: &str = "secret-seaweedfs-s3";

pub const ACCESS_KEY: &str = "s3AccessKey";
pub const SECRET_KEY: &str = "s3SecretKey";

/// S3 credentials shared by the registry and the object store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
}

fn generate_key(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

impl S3Credentials {
    pub fn generate() -> Self {
        Self {
            access_key: generate_key(20),
            secret_key: generate_key(40),
        }
    }

    fn from_secret(secret: &Secret) -> Option<Self> {
        let read = |key: &str| {
            if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
                return String::from_utf8(v.0.clone()).ok();
            }
            secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
        };
        Some(Self {
            access_key: read(ACCESS_KEY)?,
            secret_key: read(SECRET_KEY)?,
        })
    }

    /// Identity document understood by the object store
    pub fn seaweedfs_config(&self) -> Result<String> {
        Ok(serde_json::to_string(&serde_json::json!({
            "identities": [{
                "name": "registry",
                "credentials": [{
                    "accessKey": self.access_key,
                    "secretKey": self.secret_key,
                }],
                "actions": ["Admin", "Read", "List", "Tagging", "Write"],
            }]
        }))?)
    }
}

fn opaque_secret(name: &str, namespace: &str, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

async fn create_if_missing(api: &Api<Secret>, secret: &Secret) -> Result<bool> {
    match api.create(&PostParams::default(), secret).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Make sure the object store credentials exist, generating them once.
///
/// Returns the credentials in effect.
pub async fn ensure_s3_secret(client: Client) -> Result<S3Credentials> {
    let registry_api: Api<Secret> = Api::namespaced(client.clone(), REGISTRY_NAMESPACE);
    let seaweedfs_api: Api<Secret> = Api::namespaced(client, SEAWEEDFS_NAMESPACE);

    let credentials = match registry_api.get_opt(SEAWEEDFS_S3_SECRET).await? {
        Some(existing) => S3Credentials::from_secret(&existing).ok_or_else(|| {
            Error::ValidationError(format!("secret {} has no S3 keys", SEAWEEDFS_S3_SECRET))
        })?,
        None => {
            let generated = S3Credentials::generate();
            let secret = opaque_secret(
                SEAWEEDFS_S3_SECRET,
                REGISTRY_NAMESPACE,
                BTreeMap::from([
                    (ACCESS_KEY.to_string(), generated.access_key.clone()),
                    (SECRET_KEY.to_string(), generated.secret_key.clone()),
                ]),
            );
            if create_if_missing(&registry_api, &secret).await? {
                info!(secret = SEAWEEDFS_S3_SECRET, "Created object store credentials");
                generated
            } else {
                // Lost a race with another writer; use what it stored.
                let stored = registry_api.get(SEAWEEDFS_S3_SECRET).await?;
                S3Credentials::from_secret(&stored).ok_or_else(|| {
                    Error::ValidationError(format!("secret {} has no S3 keys", SEAWEEDFS_S3_SECRET))
                })?
            }
        }
    };

    let config = opaque_secret(
        SEAWEEDFS_CONFIG_SECRET,
        SEAWEEDFS_NAMESPACE,
        BTreeMap::from([("seaweedfs_s3_config".to_string(), credentials.seaweedfs_config()?)]),
    );
    create_if_missing(&seaweedfs_api, &config).await?;

    Ok(credentials)
}

/// All StatefulSets in `namespace` have every replica ready
pub async fn statefulsets_ready(client: Client, namespace: &str) -> Result<bool> {
    let api: Api<StatefulSet> = Api::namespaced(client, namespace);
    let list = api.list(&ListParams::default()).await?;
    if list.items.is_empty() {
        return Ok(false);
    }
    Ok(list.items.iter().all(|sts| {
        let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ready >= desired
    }))
}

/// The named Deployment has every replica ready
pub async fn deployment_ready(client: Client, namespace: &str, name: &str) -> Result<bool> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let Some(deployment) = api.get_opt(name).await? else {
        return Ok(false);
    };
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    Ok(ready >= desired)
}

/// High availability condition for the given observations.
///
/// Returns the condition value with its reason and message.
pub fn ha_condition(
    spec_ha: bool,
    airgap: bool,
    store_ready: bool,
    registry_ready: bool,
) -> (bool, &'static str, &'static str) {
    if !spec_ha {
        return (false, "HANotEnabled", "High availability is not enabled");
    }
    if airgap && !store_ready {
        return (false, "SeaweedFSNotReady", "Object store is not ready");
    }
    if airgap && !registry_ready {
        return (false, "RegistryNotReady", "Registry is not ready");
    }
    (true, "HAReady", "High availability is ready")
}

/// Recompute the high availability condition on `status`
pub async fn reconcile_ha_condition(
    client: Client,
    spec_ha: bool,
    airgap: bool,
    generation: Option<i64>,
    status: &mut InstallationStatus,
) -> Result<()> {
    let (store_ready, registry_ready) = if spec_ha && airgap {
        (
            statefulsets_ready(client.clone(), SEAWEEDFS_NAMESPACE).await?,
            deployment_ready(client, REGISTRY_NAMESPACE, Addon::Registry.name()).await?,
        )
    } else {
        (false, false)
    };

    let (ready, reason, message) = ha_condition(spec_ha, airgap, store_ready, registry_ready);
    status.conditions =
        ConditionBuilder::from_existing(std::mem::take(&mut status.conditions), generation)
            .high_availability(ready, reason, message)
            .build();
    Ok(())
}
