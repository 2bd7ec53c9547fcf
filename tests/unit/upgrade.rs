//! Runtime upgrade planning

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use installation_operator::controller::state_machine::InstallationEvent;
use installation_operator::controller::upgrade::{
    PLATFORM, PlanOwnership, build_plan, classify_plan, plan_event, skip_upgrade, wait_for_plan,
};
use installation_operator::controller::version::{KubeVersion, check_versions, upgrade_required};
use installation_operator::crd::{INSTALLATION_ANNOTATION, PLAN_NAME, PlanState};
use kube::ResourceExt;

use crate::common::{InstallationBuilder, node, with_plan_state};

fn nodes() -> Vec<k8s_openapi::api::core::v1::Node> {
    vec![
        node("worker-b", false, "v1.29.5+k0s"),
        node("cp-2", true, "v1.29.5+k0s"),
        node("worker-a", false, "v1.29.5+k0s"),
        node("cp-1", true, "v1.29.5+k0s"),
    ]
}

mod plan_tests {
    use super::*;

    #[test]
    fn test_build_plan_targets_every_node() {
        let plan = build_plan(
            "20240101000000",
            "v1.30.1+k0s.0",
            "https://artifacts.example.com/k0s",
            &nodes(),
            "2024-01-01T00:00:00Z",
        );

        assert_eq!(plan.name_any(), PLAN_NAME);
        assert_eq!(
            plan.annotations().get(INSTALLATION_ANNOTATION).map(String::as_str),
            Some("20240101000000")
        );
        let update = plan.k0s_update().unwrap();
        assert_eq!(update.version, "v1.30.1+k0s.0");
        assert!(update.force_update);
        assert_eq!(
            update.platforms.get(PLATFORM).unwrap().url,
            "https://artifacts.example.com/k0s"
        );

        let controllers = update.targets.controllers.discovery.static_nodes.as_ref().unwrap();
        let workers = update.targets.workers.discovery.static_nodes.as_ref().unwrap();
        assert_eq!(controllers.nodes, vec!["cp-1", "cp-2"]);
        assert_eq!(workers.nodes, vec!["worker-a", "worker-b"]);
    }

    #[test]
    fn test_classify_owned_plan() {
        let plan = build_plan("inst-1", "v1.30.1+k0s.0", "url", &nodes(), "t");
        assert_eq!(classify_plan(&plan, "inst-1", "v1.30.1+k0s.0"), PlanOwnership::Owned);
    }

    #[test]
    fn test_classify_foreign_owner() {
        let plan = build_plan("inst-1", "v1.30.1+k0s.0", "url", &nodes(), "t");
        assert_eq!(classify_plan(&plan, "inst-2", "v1.30.1+k0s.0"), PlanOwnership::Foreign);
    }

    #[test]
    fn test_classify_other_version_is_foreign() {
        let plan = build_plan("inst-1", "v1.30.1+k0s.0", "url", &nodes(), "t");
        assert_eq!(classify_plan(&plan, "inst-1", "v1.31.0+k0s.0"), PlanOwnership::Foreign);
    }

    #[test]
    fn test_classify_falls_back_to_plan_id() {
        let mut plan = build_plan("inst-1", "v1.30.1+k0s.0", "url", &nodes(), "t");
        plan.metadata.annotations = None;
        assert_eq!(classify_plan(&plan, "inst-1", "v1.30.1+k0s.0"), PlanOwnership::Owned);
    }

    #[test]
    fn test_plan_events() {
        assert_eq!(plan_event(PlanState::Completed).0, InstallationEvent::RuntimeConverged);
        assert_eq!(plan_event(PlanState::Schedulable).0, InstallationEvent::PlanProgressing);
        assert_eq!(plan_event(PlanState::SchedulableWait).0, InstallationEvent::PlanProgressing);
        assert_eq!(plan_event(PlanState::Unscheduled).0, InstallationEvent::PlanQueued);

        let (event, reason) = plan_event(PlanState::ApplyFailed);
        assert_eq!(event, InstallationEvent::UpgradeFailed);
        assert_eq!(reason, "Upgrade plan failed to apply");
    }

    #[test]
    fn test_plan_state_decoding() {
        assert_eq!(PlanState::from(""), PlanState::Unscheduled);
        assert_eq!(PlanState::from("MissingSignalNode"), PlanState::MissingSignalNode);
        assert_eq!(PlanState::from("SomethingNew"), PlanState::Unknown);
        assert!(PlanState::from("Warning").is_failure());
        assert!(!PlanState::Unknown.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_plan_until_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let base = build_plan("inst-1", "v1.30.1+k0s.0", "url", &nodes(), "t");

        let fetched = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                let base = base.clone();
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, installation_operator::Error>(match call {
                        0 => None,
                        1 => Some(with_plan_state(base, "Schedulable")),
                        _ => Some(with_plan_state(base, "Completed")),
                    })
                }
            }
        };

        let plan = wait_for_plan(fetched, Duration::from_secs(5)).await.unwrap();

        assert_eq!(plan.state(), PlanState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

mod version_tests {
    use super::*;

    fn v(raw: &str) -> KubeVersion {
        KubeVersion::parse(raw).unwrap()
    }

    #[test]
    fn test_downgrade_rejected() {
        let err = check_versions("v1.29.5+k0s.0", "v1.30.1+k0s").unwrap_err();
        assert_eq!(
            err,
            "Kubernetes downgrade from v1.30.1+k0s to v1.29.5+k0s.0 is not supported"
        );
    }

    #[test]
    fn test_qualifier_ignored_for_ordering() {
        assert!(check_versions("v1.30.1+k0s.1", "v1.30.1+k0s").is_ok());
        assert_eq!(v("v1.30.1+k0s.1"), v("v1.30.1+k0s"));
    }

    #[test]
    fn test_upgrade_required() {
        assert!(upgrade_required(&v("v1.30.1+k0s.0"), &v("v1.29.5+k0s"), None));
        assert!(!upgrade_required(&v("v1.30.1+k0s"), &v("v1.30.1+k0s"), None));
    }

    #[test]
    fn test_same_core_falls_back_to_previous() {
        let desired = v("v1.30.1+k0s.1");
        let running = v("v1.30.1+k0s");

        assert!(!upgrade_required(&desired, &running, None));
        assert!(!upgrade_required(&desired, &running, Some(&v("v1.30.1+k0s.1"))));
        assert!(upgrade_required(&desired, &running, Some(&v("v1.30.1+k0s.0"))));
    }
}

mod first_install_tests {
    use super::*;

    #[test]
    fn test_first_install_skips_upgrade() {
        assert!(skip_upgrade(Some("1.2.0"), None));
    }

    #[test]
    fn test_unversioned_install_skips_upgrade() {
        let previous = InstallationBuilder::new("20240101000000")
            .with_version("1.1.0")
            .build();
        assert!(skip_upgrade(None, Some(&previous)));
    }

    #[test]
    fn test_versioned_successor_checks_upgrade() {
        let previous = InstallationBuilder::new("20240101000000")
            .with_version("1.1.0")
            .build();
        assert!(!skip_upgrade(Some("1.2.0"), Some(&previous)));
    }
}
