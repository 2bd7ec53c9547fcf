//! Detection of pods stuck terminating on removed nodes

use std::collections::HashSet;

use installation_operator::controller::cleanup::{StuckPod, stuck_pods};

use crate::common::pod;

#[test]
fn test_only_deleting_pods_on_missing_nodes() {
    let live = HashSet::from(["cp-1".to_string()]);
    let pods = vec![
        pod("kotsadm", "console-0", "cp-1", true),
        pod("kotsadm", "console-1", "gone-1", true),
        pod("openebs", "ndm-2", "gone-1", false),
    ];

    assert_eq!(
        stuck_pods(&pods, &live),
        vec![StuckPod {
            namespace: "kotsadm".to_string(),
            name: "console-1".to_string(),
            node: "gone-1".to_string(),
        }]
    );
}

#[test]
fn test_unscheduled_pods_are_ignored() {
    let mut unscheduled = pod("default", "pending", "", true);
    unscheduled.spec.as_mut().unwrap().node_name = None;

    assert!(stuck_pods(&[unscheduled], &HashSet::new()).is_empty());
}
