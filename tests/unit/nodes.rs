//! Node inventory tracking

use installation_operator::controller::nodes::{hash_node, node_role, track_nodes};

use crate::common::{node, with_taint};

#[test]
fn test_first_pass_reports_every_node_added() {
    let nodes = vec![
        node("worker-1", false, "v1.29.5+k0s"),
        node("cp-1", true, "v1.29.5+k0s"),
    ];

    let (statuses, batch) = track_nodes(&[], &nodes).unwrap();

    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["cp-1", "worker-1"]);
    assert_eq!(batch.added.len(), 2);
    assert!(batch.updated.is_empty());
    assert!(batch.removed.is_empty());

    let cp = batch.added.iter().find(|e| e.name == "cp-1").unwrap();
    assert_eq!(cp.role, "controller");
    assert_eq!(cp.kubelet_version, "v1.29.5+k0s");
}

#[test]
fn test_second_pass_is_empty() {
    let nodes = vec![node("cp-1", true, "v1.29.5+k0s")];
    let (statuses, _) = track_nodes(&[], &nodes).unwrap();

    let (again, batch) = track_nodes(&statuses, &nodes).unwrap();

    assert_eq!(again, statuses);
    assert!(batch.is_empty());
}

#[test]
fn test_kubelet_upgrade_is_an_update() {
    let (statuses, _) = track_nodes(&[], &[node("cp-1", true, "v1.29.5+k0s")]).unwrap();

    let (_, batch) = track_nodes(&statuses, &[node("cp-1", true, "v1.30.1+k0s")]).unwrap();

    assert_eq!(batch.updated.len(), 1);
    assert_eq!(batch.updated[0].kubelet_version, "v1.30.1+k0s");
}

#[test]
fn test_taint_changes_hash() {
    let plain = node("worker-1", false, "v1.29.5+k0s");
    let tainted = with_taint(plain.clone(), "maintenance");
    assert_ne!(hash_node(&plain).unwrap(), hash_node(&tainted).unwrap());
}

#[test]
fn test_removed_node_reported_by_name() {
    let nodes = vec![
        node("cp-1", true, "v1.29.5+k0s"),
        node("worker-1", false, "v1.29.5+k0s"),
    ];
    let (statuses, _) = track_nodes(&[], &nodes).unwrap();

    let (remaining, batch) = track_nodes(&statuses, &nodes[..1]).unwrap();

    assert_eq!(remaining.len(), 1);
    assert_eq!(batch.removed, vec!["worker-1".to_string()]);
    assert!(batch.added.is_empty());
}

#[test]
fn test_node_role() {
    assert_eq!(node_role(&node("cp-1", true, "v1.29.5")), "controller");
    assert_eq!(node_role(&node("w-1", false, "v1.29.5")), "worker");
}

#[test]
fn test_hash_is_stable() {
    let n = node("cp-1", true, "v1.29.5+k0s");
    assert_eq!(hash_node(&n).unwrap(), hash_node(&n.clone()).unwrap());
    assert_eq!(hash_node(&n).unwrap().len(), 64);
}
