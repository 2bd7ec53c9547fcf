use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Only one upgrade plan may exist in the cluster and it always has this name
pub const PLAN_NAME: &str = "autopilot";

/// Annotation linking a plan to the Installation that created it
pub const INSTALLATION_ANNOTATION: &str = "installer.cluster.dev/installation-name";

/// Runtime upgrade plan executed node by node by the runtime's autopilot
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "autopilot.k0sproject.io",
    version = "v1beta2",
    kind = "Plan",
    plural = "plans",
    status = "PlanStatus"
)]
pub struct PlanSpec {
    /// Identifier of the plan, set to the owning Installation's name
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default)]
    pub commands: Vec<PlanCommand>,
}

/// One plan step. Exactly one of the fields is set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommand {
    #[serde(rename = "k0supdate", default, skip_serializing_if = "Option::is_none")]
    pub k0s_update: Option<PlanCommandK0sUpdate>,

    #[serde(rename = "airgapupdate", default, skip_serializing_if = "Option::is_none")]
    pub airgap_update: Option<PlanCommandAirgapUpdate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommandK0sUpdate {
    pub version: String,

    #[serde(rename = "forceupdate", default, skip_serializing_if = "std::ops::Not::not")]
    pub force_update: bool,

    /// Download location per "os-arch" platform
    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,

    #[serde(default)]
    pub targets: PlanCommandTargets,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommandAirgapUpdate {
    pub version: String,

    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,

    #[serde(default)]
    pub workers: PlanCommandTarget,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PlanResourceUrl {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommandTargets {
    #[serde(default)]
    pub controllers: PlanCommandTarget,

    #[serde(default)]
    pub workers: PlanCommandTarget,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommandTarget {
    #[serde(default)]
    pub discovery: PlanCommandTargetDiscovery,
}

/// Node discovery for a plan target
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanCommandTargetDiscovery {
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_nodes: Option<PlanCommandTargetStatic>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PlanCommandTargetSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PlanCommandTargetStatic {
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PlanCommandTargetSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanStatus {
    /// Raw plan state as written by the autopilot; see [`PlanState`]
    #[serde(default)]
    pub state: String,
}

/// Decoded plan state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanState {
    /// Accepted but not yet scheduled (empty state)
    Unscheduled,
    Schedulable,
    SchedulableWait,
    Completed,
    Warning,
    InconsistentTargets,
    IncompleteTargets,
    Restricted,
    MissingSignalNode,
    ApplyFailed,
    /// Any state this operator does not know about
    Unknown,
}

impl From<&str> for PlanState {
    fn from(s: &str) -> Self {
        match s {
            "" => PlanState::Unscheduled,
            "Schedulable" => PlanState::Schedulable,
            "SchedulableWait" => PlanState::SchedulableWait,
            "Completed" => PlanState::Completed,
            "Warning" => PlanState::Warning,
            "InconsistentTargets" => PlanState::InconsistentTargets,
            "IncompleteTargets" => PlanState::IncompleteTargets,
            "Restricted" => PlanState::Restricted,
            "MissingSignalNode" => PlanState::MissingSignalNode,
            "ApplyFailed" => PlanState::ApplyFailed,
            _ => PlanState::Unknown,
        }
    }
}

impl PlanState {
    /// True for every failure variant
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PlanState::Warning
                | PlanState::InconsistentTargets
                | PlanState::IncompleteTargets
                | PlanState::Restricted
                | PlanState::MissingSignalNode
                | PlanState::ApplyFailed
        )
    }

    /// A terminal plan is never going to change state again
    pub fn is_terminal(&self) -> bool {
        *self == PlanState::Completed || self.is_failure()
    }

    /// Human readable explanation of a failure state
    pub fn failure_reason(&self) -> Option<&'static str> {
        match self {
            PlanState::Warning => Some("Upgrade plan finished with warnings"),
            PlanState::InconsistentTargets => {
                Some("Upgrade plan targets are inconsistent across nodes")
            }
            PlanState::IncompleteTargets => Some("Upgrade plan targets nodes that do not exist"),
            PlanState::Restricted => Some("Upgrade plan is restricted by the cluster"),
            PlanState::MissingSignalNode => Some("Upgrade plan references a node that is missing"),
            PlanState::ApplyFailed => Some("Upgrade plan failed to apply"),
            _ => None,
        }
    }
}

impl Plan {
    pub fn state(&self) -> PlanState {
        self.status
            .as_ref()
            .map(|s| PlanState::from(s.state.as_str()))
            .unwrap_or(PlanState::Unscheduled)
    }

    /// The runtime version update step, if this plan carries one
    pub fn k0s_update(&self) -> Option<&PlanCommandK0sUpdate> {
        self.spec.commands.iter().find_map(|c| c.k0s_update.as_ref())
    }
}
