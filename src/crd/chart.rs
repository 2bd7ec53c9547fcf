use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name prefix the runtime gives to Chart resources it generates from the
/// cluster configuration
pub const CHART_NAME_PREFIX: &str = "k0s-addon-chart-";

/// Live chart release managed by the runtime's helm controller.
///
/// Read to decide whether a desired chart has been applied.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "helm.k0sproject.io",
    version = "v1beta1",
    kind = "Chart",
    plural = "charts",
    namespaced,
    status = "ChartStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    #[serde(default)]
    pub chart_name: String,

    #[serde(default)]
    pub release_name: String,

    #[serde(default)]
    pub values: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default)]
    pub order: i32,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_upgrade: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Hash of the values last applied by the helm controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_hash: Option<String>,
}

impl ChartSpec {
    /// Hex sha256 of the declared values, comparable to `status.valuesHash`.
    pub fn hash_values(&self) -> String {
        format!("{:x}", Sha256::digest(self.values.as_bytes()))
    }
}

impl Chart {
    /// Release name, falling back to the resource name minus the runtime prefix.
    pub fn release_name(&self) -> String {
        if !self.spec.release_name.is_empty() {
            return self.spec.release_name.clone();
        }
        let name = self.metadata.name.clone().unwrap_or_default();
        name.strip_prefix(CHART_NAME_PREFIX)
            .map(str::to_string)
            .unwrap_or(name)
    }

    pub fn status_error(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.error.as_deref())
            .filter(|e| !e.is_empty())
    }
}
