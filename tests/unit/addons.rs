//! Built-in addon rendering and installation

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use installation_operator::addons::{
    Addon, AddonOptions, ChartResourceClient, HelmClient, ProxySpec, generate_helm_defaults,
};
use installation_operator::controller::Result;
use installation_operator::crd::{BuiltInExtension, HelmChart};
use kube::ResourceExt;

use crate::common::release_metadata;

fn values(chart: &HelmChart) -> serde_json::Value {
    serde_yaml::from_str(&chart.values).unwrap()
}

/// Helm client recording the releases it was asked to touch
#[derive(Default)]
struct RecordingHelm {
    existing: HashSet<String>,
    installed: Mutex<Vec<String>>,
    upgraded: Mutex<Vec<String>>,
}

#[async_trait]
impl HelmClient for RecordingHelm {
    async fn release_exists(&self, _namespace: &str, release: &str) -> Result<bool> {
        Ok(self.existing.contains(release))
    }

    async fn install(&self, chart: &HelmChart) -> Result<()> {
        self.installed.lock().unwrap().push(chart.name.clone());
        Ok(())
    }

    async fn upgrade(&self, chart: &HelmChart) -> Result<()> {
        self.upgraded.lock().unwrap().push(chart.name.clone());
        Ok(())
    }
}

mod defaults_tests {
    use super::*;

    #[test]
    fn test_online_single_node_chart_set() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let defaults = generate_helm_defaults(&meta, &AddonOptions::default()).unwrap();

        let names: Vec<&str> = defaults.charts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["openebs", "admin-console", "embedded-cluster-operator"]);
        assert_eq!(defaults.repositories, meta.configs.repositories);
        assert_eq!(defaults.concurrency_level, 1);

        let console = defaults.chart("admin-console").unwrap();
        assert_eq!(console.target_ns, "kotsadm");
        assert_eq!(console.order, 5);
        assert_eq!(console.version, "1.117.0");
        assert_eq!(values(console)["isHA"], serde_json::json!(false));
        assert_eq!(values(console)["replicas"], serde_json::json!(1));
    }

    #[test]
    fn test_airgap_ha_registry_uses_object_store() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let opts = AddonOptions {
            airgap: true,
            high_availability: true,
            service_cidr: Some("10.96.0.0/12".to_string()),
            ..Default::default()
        };

        let defaults = generate_helm_defaults(&meta, &opts).unwrap();
        let registry = values(defaults.chart("docker-registry").unwrap());

        assert_eq!(registry["service"]["clusterIP"], "10.96.0.10");
        assert_eq!(registry["replicaCount"], 2);
        assert_eq!(registry["storage"], "s3");
        assert_eq!(registry["s3"]["regionEndpoint"], "http://10.96.0.11:8333");
        assert!(defaults.chart("seaweedfs").is_some());
    }

    #[test]
    fn test_airgap_without_ha_has_no_object_store() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let opts = AddonOptions {
            airgap: true,
            service_cidr: Some("10.96.0.0/12".to_string()),
            ..Default::default()
        };

        let defaults = generate_helm_defaults(&meta, &opts).unwrap();
        let registry = values(defaults.chart("docker-registry").unwrap());

        assert!(defaults.chart("seaweedfs").is_none());
        assert!(registry.get("storage").is_none());
    }

    #[test]
    fn test_proxy_reaches_velero() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let opts = AddonOptions {
            disaster_recovery: true,
            proxy: Some(ProxySpec {
                https_proxy: Some("http://proxy:3128".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let defaults = generate_helm_defaults(&meta, &opts).unwrap();
        let velero = values(defaults.chart("velero").unwrap());

        assert_eq!(
            velero["configuration"]["extraEnvVars"][0]["name"],
            "HTTPS_PROXY"
        );
    }

    #[test]
    fn test_overrides_win_over_topology_values() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let opts = AddonOptions {
            overrides: vec![BuiltInExtension {
                name: "admin-console".to_string(),
                values: "isHA: true\n".to_string(),
            }],
            ..Default::default()
        };

        let chart = Addon::AdminConsole.generate_chart(&meta, &opts).unwrap();
        assert_eq!(values(&chart)["isHA"], serde_json::json!(true));
    }

    #[test]
    fn test_missing_default_chart_is_a_validation_error() {
        let mut meta = release_metadata("v1.30.1+k0s.0");
        meta.configs.charts.retain(|c| c.name != "openebs");

        let err = generate_helm_defaults(&meta, &AddonOptions::default()).unwrap_err();
        assert!(matches!(err, installation_operator::Error::ValidationError(_)));
    }
}

mod helm_tests {
    use super::*;

    #[tokio::test]
    async fn test_install_skips_existing_release() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let helm = RecordingHelm {
            existing: HashSet::from(["openebs".to_string()]),
            ..Default::default()
        };

        Addon::OpenEbs
            .install(&helm, &meta, &AddonOptions::default())
            .await
            .unwrap();
        Addon::AdminConsole
            .install(&helm, &meta, &AddonOptions::default())
            .await
            .unwrap();

        assert_eq!(*helm.installed.lock().unwrap(), vec!["admin-console".to_string()]);
    }

    #[tokio::test]
    async fn test_upgrade_always_applies() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let helm = RecordingHelm {
            existing: HashSet::from(["admin-console".to_string()]),
            ..Default::default()
        };

        Addon::AdminConsole
            .upgrade(&helm, &meta, &AddonOptions::default())
            .await
            .unwrap();

        assert_eq!(*helm.upgraded.lock().unwrap(), vec!["admin-console".to_string()]);
    }

    #[test]
    fn test_chart_resource_naming() {
        let meta = release_metadata("v1.30.1+k0s.0");
        let chart = Addon::Registry
            .generate_chart(&meta, &AddonOptions::default())
            .unwrap();

        let resource = ChartResourceClient::chart_resource(&chart);

        assert_eq!(resource.name_any(), "k0s-addon-chart-docker-registry");
        assert_eq!(resource.namespace().as_deref(), Some("kube-system"));
        assert_eq!(resource.release_name(), "docker-registry");
        assert_eq!(resource.spec.namespace, "registry");
    }
}
