use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the cluster-wide runtime configuration object
pub const CLUSTER_CONFIG_NAME: &str = "k0s";

/// Namespace of the runtime configuration object and the Chart resources
pub const CLUSTER_CONFIG_NAMESPACE: &str = "kube-system";

/// Runtime configuration object whose `extensions.helm` section declares the
/// charts the runtime keeps installed.
///
/// Only the chart extension section is modeled; every other field is carried
/// through untouched so that writing the object back never drops settings.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "k0s.k0sproject.io",
    version = "v1beta1",
    kind = "ClusterConfig",
    plural = "clusterconfigs",
    namespaced
)]
pub struct ClusterConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ClusterExtensions>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmExtensions>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl ClusterConfig {
    /// Chart extensions currently declared, empty when unset.
    pub fn helm(&self) -> HelmExtensions {
        self.spec
            .extensions
            .as_ref()
            .and_then(|e| e.helm.clone())
            .unwrap_or_default()
    }

    /// Replace the chart extensions section.
    pub fn set_helm(&mut self, helm: HelmExtensions) {
        self.spec
            .extensions
            .get_or_insert_with(ClusterExtensions::default)
            .helm = Some(helm);
    }
}

/// Desired chart set plus the repositories it is pulled from
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmExtensions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<HelmRepository>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<HelmChart>,

    /// Maximum number of charts the runtime installs concurrently
    #[serde(default, skip_serializing_if = "is_zero")]
    pub concurrency_level: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl HelmExtensions {
    pub fn chart(&self, name: &str) -> Option<&HelmChart> {
        self.charts.iter().find(|c| c.name == name)
    }
}

/// One chart repository
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepository {
    pub name: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One desired chart
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    /// Release name
    pub name: String,

    /// Chart reference, e.g. "oci://registry/charts/admin-console"
    #[serde(rename = "chartname")]
    pub chart_name: String,

    #[serde(default)]
    pub version: String,

    /// Rendered values as a YAML document
    #[serde(default)]
    pub values: String,

    #[serde(rename = "namespace", default)]
    pub target_ns: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Install order weight, lower goes first
    #[serde(default)]
    pub order: i32,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_upgrade: bool,
}

/// Value override for a built-in chart, merged into its rendered values
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct BuiltInExtension {
    pub name: String,

    /// YAML document deep-merged over the chart values
    #[serde(default)]
    pub values: String,
}
