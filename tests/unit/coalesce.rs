//! Selection of the authoritative Installation

use installation_operator::controller::coalesce::{
    OBSOLETE_REASON, coalesce_installations, mark_obsolete,
};
use installation_operator::crd::InstallationState;
use kube::ResourceExt;

use crate::common::InstallationBuilder;

#[test]
fn test_no_installations() {
    assert!(coalesce_installations(Vec::new()).is_none());
}

#[test]
fn test_greatest_name_wins() {
    let coalesced = coalesce_installations(vec![
        InstallationBuilder::new("20240101000000").build(),
        InstallationBuilder::new("20240301000000").build(),
        InstallationBuilder::new("20240201000000").build(),
    ])
    .unwrap();

    assert_eq!(coalesced.current.name_any(), "20240301000000");
    let older: Vec<String> = coalesced.older.iter().map(|i| i.name_any()).collect();
    assert_eq!(older, vec!["20240201000000", "20240101000000"]);
    assert_eq!(coalesced.previous().unwrap().name_any(), "20240201000000");
}

#[test]
fn test_inherits_nodes_from_newest_older_record() {
    let coalesced = coalesce_installations(vec![
        InstallationBuilder::new("20240101000000")
            .with_nodes(&[("old", "1")])
            .build(),
        InstallationBuilder::new("20240201000000")
            .with_nodes(&[("cp-1", "2"), ("cp-2", "3")])
            .build(),
        InstallationBuilder::new("20240301000000").build(),
    ])
    .unwrap();

    let nodes = &coalesced.current.status.as_ref().unwrap().nodes_status;
    let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["cp-1", "cp-2"]);
}

#[test]
fn test_own_nodes_are_kept() {
    let coalesced = coalesce_installations(vec![
        InstallationBuilder::new("20240101000000")
            .with_nodes(&[("old", "1")])
            .build(),
        InstallationBuilder::new("20240201000000")
            .with_nodes(&[("cp-1", "2")])
            .build(),
    ])
    .unwrap();

    let nodes = &coalesced.current.status.as_ref().unwrap().nodes_status;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "cp-1");
}

#[test]
fn test_mark_obsolete_clears_nodes() {
    let mut older = InstallationBuilder::new("20240101000000")
        .with_state(InstallationState::Installed)
        .with_nodes(&[("cp-1", "1")])
        .build();

    assert!(mark_obsolete(&mut older));

    let status = older.status.as_ref().unwrap();
    assert_eq!(status.state, InstallationState::Obsolete);
    assert_eq!(status.reason, OBSOLETE_REASON);
    assert!(status.nodes_status.is_empty());
}

#[test]
fn test_mark_obsolete_supersedes_failed_records() {
    let mut failed = InstallationBuilder::new("20240101000000")
        .with_state(InstallationState::Failed)
        .build();

    assert!(mark_obsolete(&mut failed));
    assert_eq!(failed.state(), InstallationState::Obsolete);
}

#[test]
fn test_mark_obsolete_is_idempotent() {
    let mut older = InstallationBuilder::new("20240101000000")
        .with_state(InstallationState::Installed)
        .build();

    assert!(mark_obsolete(&mut older));
    assert!(!mark_obsolete(&mut older));
}
