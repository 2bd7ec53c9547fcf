//! Chart drift, completion and the chart phase decision

use installation_operator::addons::AddonOptions;
use installation_operator::controller::charts::{
    BuiltInCharts, ChartAction, ChartCompletion, ChartDrift, MAX_REASON_LENGTH, builtin_charts,
    combine_helm, decide_chart_action, detect_chart_completion, detect_chart_drift, merge_values,
    truncate_reason, values_differ,
};
use installation_operator::crd::{BuiltInExtension, HelmExtensions, HelmRepository, InstallationState};

use crate::common::{helm_chart, helm_extensions, live_chart, release_metadata};

fn override_for(name: &str, values: &str) -> BuiltInExtension {
    BuiltInExtension {
        name: name.to_string(),
        values: values.to_string(),
    }
}

mod values_tests {
    use super::*;

    #[test]
    fn test_key_order_and_comments_do_not_differ() {
        let a = "replicas: 1\nimage:\n  tag: v1\n  repo: example\n";
        let b = "# defaults\nimage:\n  repo: example\n  tag: v1\nreplicas: 1\n";
        assert!(!values_differ(a, b));
    }

    #[test]
    fn test_empty_documents_are_equal() {
        assert!(!values_differ("", "   \n"));
        assert!(values_differ("", "replicas: 1"));
    }

    #[test]
    fn test_value_change_differs() {
        assert!(values_differ("replicas: 1", "replicas: 2"));
    }

    #[test]
    fn test_merge_is_deep() {
        let merged = merge_values(
            "image:\n  repo: example\n  tag: v1\nreplicas: 1\n",
            "image:\n  tag: v2\n",
        )
        .unwrap();
        assert!(!values_differ(
            &merged,
            "image:\n  repo: example\n  tag: v2\nreplicas: 1\n"
        ));
    }

    #[test]
    fn test_merge_into_empty_values() {
        let merged = merge_values("", "replicas: 3\n").unwrap();
        assert!(!values_differ(&merged, "replicas: 3"));
    }
}

mod combine_tests {
    use super::*;

    #[test]
    fn test_vendor_chart_replaces_default_by_name() {
        let defaults = helm_extensions(vec![
            helm_chart("openebs", "4.1.0", "a: 1", 1),
            helm_chart("admin-console", "1.0.0", "b: 1", 5),
        ]);
        let vendor = HelmExtensions {
            repositories: vec![HelmRepository {
                name: "vendor".to_string(),
                url: "https://vendor.example.com".to_string(),
                ..Default::default()
            }],
            charts: vec![
                helm_chart("admin-console", "2.0.0", "b: 2", 5),
                helm_chart("vendor-app", "0.1.0", "", 10),
            ],
            concurrency_level: 0,
        };

        let combined = combine_helm(&defaults, Some(&vendor), &[], &[]).unwrap();

        let names: Vec<&str> = combined.charts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["openebs", "admin-console", "vendor-app"]);
        assert_eq!(combined.chart("admin-console").unwrap().version, "2.0.0");
        assert_eq!(combined.repositories.len(), 1);
    }

    #[test]
    fn test_end_user_overrides_applied_last() {
        let defaults = helm_extensions(vec![helm_chart("admin-console", "1.0.0", "a: 1\nb: 1\n", 5)]);

        let combined = combine_helm(
            &defaults,
            None,
            &[override_for("admin-console", "a: 2\nb: 2\n")],
            &[override_for("admin-console", "b: 3\n")],
        )
        .unwrap();

        let values = &combined.chart("admin-console").unwrap().values;
        assert!(!values_differ(values, "a: 2\nb: 3\n"));
    }

    #[test]
    fn test_override_for_unknown_chart_is_ignored() {
        let defaults = helm_extensions(vec![helm_chart("openebs", "4.1.0", "a: 1", 1)]);
        let combined = combine_helm(&defaults, None, &[], &[override_for("missing", "a: 2")]).unwrap();
        assert_eq!(combined, defaults);
    }

    #[test]
    fn test_charts_sorted_by_order() {
        let defaults = helm_extensions(vec![
            helm_chart("operator", "1.0.0", "", 6),
            helm_chart("openebs", "1.0.0", "", 1),
        ]);
        let combined = combine_helm(&defaults, None, &[], &[]).unwrap();
        assert_eq!(combined.charts[0].name, "openebs");
    }
}

mod drift_tests {
    use super::*;

    #[test]
    fn test_no_drift_on_reordered_values() {
        let desired = helm_extensions(vec![helm_chart("openebs", "4.1.0", "a: 1\nb: 2\n", 1)]);
        let current = helm_extensions(vec![helm_chart("openebs", "4.1.0", "b: 2\na: 1\n", 1)]);
        assert_eq!(detect_chart_drift(&desired, &current), ChartDrift::default());
    }

    #[test]
    fn test_version_change_is_drift() {
        let desired = helm_extensions(vec![helm_chart("openebs", "4.2.0", "a: 1", 1)]);
        let current = helm_extensions(vec![helm_chart("openebs", "4.1.0", "a: 1", 1)]);

        let drift = detect_chart_drift(&desired, &current);
        assert!(drift.drift);
        assert_eq!(drift.names, vec!["openebs".to_string()]);
    }

    #[test]
    fn test_new_chart_is_drift() {
        let desired = helm_extensions(vec![
            helm_chart("openebs", "4.1.0", "", 1),
            helm_chart("velero", "8.0.0", "", 3),
        ]);
        let current = helm_extensions(vec![helm_chart("openebs", "4.1.0", "", 1)]);
        assert_eq!(detect_chart_drift(&desired, &current).names, vec!["velero".to_string()]);
    }

    #[test]
    fn test_repository_count_change_is_drift() {
        let desired = HelmExtensions {
            repositories: vec![HelmRepository::default()],
            ..Default::default()
        };
        let drift = detect_chart_drift(&desired, &HelmExtensions::default());
        assert!(drift.drift);
        assert!(drift.names.is_empty());
    }
}

mod completion_tests {
    use super::*;

    #[test]
    fn test_partition_of_configured_charts() {
        let configured = helm_extensions(vec![
            helm_chart("complete", "1.0.0", "a: 1", 1),
            helm_chart("incomplete", "1.0.0", "a: 1", 2),
            helm_chart("errored", "1.0.0", "a: 1", 3),
            helm_chart("missing", "1.0.0", "a: 1", 4),
        ]);
        let installed = vec![
            live_chart("complete", "1.0.0", "a: 1", true, None),
            live_chart("incomplete", "1.0.0", "a: 1", false, None),
            live_chart("errored", "1.0.0", "a: 1", true, Some("release failed")),
        ];

        let completion = detect_chart_completion(&configured, &installed);

        assert_eq!(completion.complete, vec!["complete".to_string()]);
        assert_eq!(completion.incomplete, vec!["incomplete".to_string()]);
        assert_eq!(completion.errored, vec!["errored".to_string()]);
        assert_eq!(completion.missing, vec!["missing".to_string()]);
        assert_eq!(completion.errors, vec!["errored: release failed".to_string()]);
        assert_eq!(
            completion.pending(),
            vec!["incomplete".to_string(), "missing".to_string()]
        );
    }

    #[test]
    fn test_stale_live_values_are_incomplete() {
        let configured = helm_extensions(vec![helm_chart("openebs", "1.0.0", "a: 2", 1)]);
        let installed = vec![live_chart("openebs", "1.0.0", "a: 1", true, None)];

        let completion = detect_chart_completion(&configured, &installed);
        assert_eq!(completion.incomplete, vec!["openebs".to_string()]);
    }

    #[test]
    fn test_live_version_mismatch_is_incomplete() {
        let configured = helm_extensions(vec![helm_chart("openebs", "1.1.0", "a: 1", 1)]);
        let installed = vec![live_chart("openebs", "1.0.0", "a: 1", true, None)];

        let completion = detect_chart_completion(&configured, &installed);
        assert_eq!(completion.incomplete, vec!["openebs".to_string()]);
    }
}

mod decision_tests {
    use super::*;

    fn completion(pending: &[&str], errors: &[&str]) -> ChartCompletion {
        ChartCompletion {
            missing: pending.iter().map(|s| s.to_string()).collect(),
            errors: errors.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn drift(drift: bool) -> ChartDrift {
        ChartDrift {
            drift,
            names: Vec::new(),
        }
    }

    #[test]
    fn test_converged() {
        assert_eq!(
            decide_chart_action(InstallationState::Installed, &drift(false), &completion(&[], &[])),
            ChartAction::Converged
        );
    }

    #[test]
    fn test_errors_without_drift_fail() {
        let action = decide_chart_action(
            InstallationState::Installed,
            &drift(false),
            &completion(&[], &["openebs: boom", "velero: bang"]),
        );
        assert_eq!(
            action,
            ChartAction::Fail("failed to update helm charts: openebs: boom,velero: bang".to_string())
        );
    }

    #[test]
    fn test_errors_with_drift_reapply() {
        let action = decide_chart_action(
            InstallationState::HelmChartUpdateFailure,
            &drift(true),
            &completion(&[], &["openebs: boom"]),
        );
        assert_eq!(action, ChartAction::Apply);
    }

    #[test]
    fn test_pending_charts() {
        let action = decide_chart_action(
            InstallationState::AddonsInstalling,
            &drift(true),
            &completion(&["openebs"], &[]),
        );
        assert_eq!(action, ChartAction::Pending(vec!["openebs".to_string()]));
    }

    #[test]
    fn test_wait_while_previous_write_applies() {
        let action = decide_chart_action(
            InstallationState::AddonsInstalling,
            &drift(true),
            &completion(&[], &[]),
        );
        assert_eq!(action, ChartAction::Wait);
    }

    #[test]
    fn test_failure_reason_is_truncated() {
        let long = "x".repeat(MAX_REASON_LENGTH * 2);
        let action = decide_chart_action(
            InstallationState::Installed,
            &drift(false),
            &completion(&[], &[long.as_str()]),
        );
        match action {
            ChartAction::Fail(reason) => assert_eq!(reason.len(), MAX_REASON_LENGTH),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let reason = "é".repeat(10);
        let truncated = truncate_reason(&reason, 5);
        assert_eq!(truncated, "éé");
    }
}

mod builtin_tests {
    use super::*;

    #[test]
    fn test_missing_metadata_is_not_an_empty_chart_set() {
        let charts = builtin_charts(Some("1.2.0"), None, &AddonOptions::default()).unwrap();
        assert_eq!(charts, BuiltInCharts::MetadataMissing);
    }

    #[test]
    fn test_unversioned_installation_is_unmanaged() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let charts = builtin_charts(None, Some(&meta), &AddonOptions::default()).unwrap();
        assert_eq!(charts, BuiltInCharts::Unmanaged);
    }

    #[test]
    fn test_metadata_yields_builtin_charts() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let BuiltInCharts::Ready(defaults) =
            builtin_charts(Some("1.2.0"), Some(&meta), &AddonOptions::default()).unwrap()
        else {
            panic!("expected built-in charts");
        };

        let names: Vec<&str> = defaults.charts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["openebs", "admin-console", "embedded-cluster-operator"]);

        // Folding the built-ins into an unchanged config must not report them as removed
        let combined = combine_helm(&defaults, None, &[], &[]).unwrap();
        assert!(!detect_chart_drift(&combined, &combined).drift);
    }
}
