use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{BuiltInExtension, HelmExtensions};

/// Installation is the desired and observed state of one cluster deployment.
///
/// Several Installation objects can exist at once (one per upgrade attempt).
/// Names are chronologically sortable; the greatest name is the one being
/// reconciled and older ones are marked `Obsolete`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "installer.cluster.dev",
    version = "v1beta1",
    kind = "Installation",
    plural = "installations",
    shortname = "inst",
    status = "InstallationStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.config.version"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// Unique identifier of the cluster, reported alongside every event.
    #[serde(default)]
    pub cluster_id: String,

    /// Base URL events are reported to. Unset disables reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_base_url: Option<String>,

    /// Whether the cluster was installed without internet access.
    #[serde(default)]
    pub air_gap: bool,

    /// Whether the cluster runs in high availability mode.
    #[serde(default)]
    pub high_availability: bool,

    /// Distribution config: version and vendor chart extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSpec>,

    /// Secret holding the config spec. Supersedes `config` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret: Option<ConfigSecretRef>,

    /// Value overrides supplied by the end user at install time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub end_user_overrides: Vec<BuiltInExtension>,

    /// Network CIDRs of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,

    /// Flags derived from the license.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_info: Option<LicenseInfo>,
}

/// Distribution config carried by an Installation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Distribution version, e.g. "1.29.5+ec.1"
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub extensions: ConfigExtensions,

    #[serde(default)]
    pub unsupported_overrides: UnsupportedOverrides,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigExtensions {
    /// Vendor supplied charts and repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmExtensions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnsupportedOverrides {
    /// Vendor overrides for the values of built-in charts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub built_in_extensions: Vec<BuiltInExtension>,
}

/// Reference to a Secret holding a serialized `ConfigSpec` under `config.yaml`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSecretRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port_range: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LicenseInfo {
    #[serde(default)]
    pub is_disaster_recovery_supported: bool,
}

/// Observed state of an Installation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    #[serde(default)]
    pub state: InstallationState,

    #[serde(default)]
    pub reason: String,

    /// Last observed node inventory, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_status: Vec<NodeStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Charts configured but not yet applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_charts: Vec<String>,
}

impl InstallationStatus {
    /// Set the lifecycle state. Pending charts are only kept while the
    /// installation waits on chart creation.
    pub fn set_state(&mut self, state: InstallationState, reason: &str, pending_charts: Vec<String>) {
        self.state = state;
        self.reason = reason.to_string();
        self.pending_charts = if state == InstallationState::PendingChartCreation {
            pending_charts
        } else {
            Vec::new()
        };
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Installation lifecycle state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum InstallationState {
    /// Waiting for a previous upgrade or for release metadata
    #[default]
    Waiting,
    /// Upgrade plan created but not yet scheduled
    Enqueued,
    /// Upgrade plan is being applied to the nodes
    Installing,
    /// Runtime version converged
    KubernetesInstalled,
    /// New chart configuration written, waiting for it to take effect
    AddonsInstalling,
    /// Configured charts exist in configuration but not in the cluster
    PendingChartCreation,
    /// At least one chart reports an error
    HelmChartUpdateFailure,
    /// Runtime and charts converged
    Installed,
    /// Unrecoverable error for this record
    Failed,
    /// Superseded by a newer Installation
    Obsolete,
}

impl InstallationState {
    /// True once the runtime version has converged for this record.
    pub fn runtime_converged(&self) -> bool {
        matches!(
            self,
            InstallationState::KubernetesInstalled
                | InstallationState::AddonsInstalling
                | InstallationState::PendingChartCreation
                | InstallationState::HelmChartUpdateFailure
                | InstallationState::Installed
        )
    }

    /// Terminal states are never reconciled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallationState::Failed | InstallationState::Obsolete)
    }
}

impl std::fmt::Display for InstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallationState::Waiting => write!(f, "Waiting"),
            InstallationState::Enqueued => write!(f, "Enqueued"),
            InstallationState::Installing => write!(f, "Installing"),
            InstallationState::KubernetesInstalled => write!(f, "KubernetesInstalled"),
            InstallationState::AddonsInstalling => write!(f, "AddonsInstalling"),
            InstallationState::PendingChartCreation => write!(f, "PendingChartCreation"),
            InstallationState::HelmChartUpdateFailure => write!(f, "HelmChartUpdateFailure"),
            InstallationState::Installed => write!(f, "Installed"),
            InstallationState::Failed => write!(f, "Failed"),
            InstallationState::Obsolete => write!(f, "Obsolete"),
        }
    }
}

/// Last observed state of one node
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
pub struct NodeStatus {
    pub name: String,
    pub hash: String,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False, or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Installation {
    /// Requested distribution version, if any.
    pub fn desired_version(&self) -> Option<&str> {
        self.spec
            .config
            .as_ref()
            .map(|c| c.version.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn state(&self) -> InstallationState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn service_cidr(&self) -> Option<&str> {
        self.spec
            .network
            .as_ref()
            .and_then(|n| n.service_cidr.as_deref())
    }

    pub fn disaster_recovery_enabled(&self) -> bool {
        self.spec
            .license_info
            .as_ref()
            .is_some_and(|l| l.is_disaster_recovery_supported)
    }
}
