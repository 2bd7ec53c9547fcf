//! Status and conditions management for Installation resources
//!
//! This module provides utilities for managing Kubernetes-style conditions,
//! driving state changes through the state machine and writing the status
//! subresource with optimistic concurrency.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    InstallationEvent, InstallationStateMachine, TransitionContext, TransitionResult,
};
use crate::crd::{Condition, Installation, InstallationState, InstallationStatus};
use crate::reporting::InstallationReport;

/// Field manager used for every write made by the operator
pub const FIELD_MANAGER: &str = "installation-operator";

/// Condition types written on Installation status
pub mod condition_types {
    /// High availability is requested and its backing services are ready
    pub const HIGH_AVAILABILITY: &str = "HighAvailability";
    /// Registry data has been copied into the replicated object store
    pub const REGISTRY_MIGRATION: &str = "RegistryMigration";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    /// The transition time only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn high_availability(self, ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::HIGH_AVAILABILITY,
            bool_status(ready),
            reason,
            message,
        )
    }

    pub fn registry_migration(self, migrated: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::REGISTRY_MIGRATION,
            bool_status(migrated),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Feed an event through the state machine and apply the resulting state.
///
/// Returns true when the event was accepted. Rejected events leave the status
/// untouched.
pub fn apply_event(
    status: &mut InstallationStatus,
    event: InstallationEvent,
    ctx: &TransitionContext,
    reason: &str,
    pending_charts: Vec<String>,
) -> bool {
    let sm = InstallationStateMachine::new();
    match sm.transition(&status.state, event, ctx) {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => {
            if from != to {
                info!(from = %from, to = %to, event = %event, "{}", description);
            }
            status.set_state(to, reason, pending_charts);
            true
        }
        TransitionResult::InvalidTransition { current, event } => {
            debug!(state = %current, event = %event, "Event does not apply to current state");
            false
        }
        TransitionResult::GuardFailed {
            from, event, reason, ..
        } => {
            debug!(state = %from, event = %event, "Transition guard rejected: {}", reason);
            false
        }
    }
}

/// Copy of the status taken before a reconcile pass
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    before: InstallationStatus,
}

impl StatusSnapshot {
    pub fn capture(installation: &Installation) -> Self {
        Self {
            before: installation.status.clone().unwrap_or_default(),
        }
    }

    pub fn state(&self) -> InstallationState {
        self.before.state
    }

    /// Whether anything persisted on the status differs
    pub fn changed(&self, current: &InstallationStatus) -> bool {
        self.before != *current
    }

    /// Installation level events implied by the state change
    pub fn reports(&self, current: &InstallationStatus) -> Vec<InstallationReport> {
        let before = self.before.state;
        let after = current.state;
        if before == after {
            return Vec::new();
        }
        let upgrading = |s: InstallationState| {
            matches!(s, InstallationState::Enqueued | InstallationState::Installing)
        };
        match after {
            s if upgrading(s) && !upgrading(before) => vec![InstallationReport::UpgradeStarted],
            InstallationState::Installed => vec![InstallationReport::UpgradeSucceeded],
            InstallationState::Failed => {
                vec![InstallationReport::UpgradeFailed(current.reason.clone())]
            }
            _ => Vec::new(),
        }
    }
}

/// Status writer for Installation resources
pub struct StatusManager<'a> {
    installation: &'a Installation,
    ctx: &'a Context,
}

impl<'a> StatusManager<'a> {
    pub fn new(installation: &'a Installation, ctx: &'a Context) -> Self {
        Self { installation, ctx }
    }

    /// Write the full status.
    ///
    /// The patch carries the resource version read at the start of the pass;
    /// a concurrent write surfaces as [`Error::Conflict`].
    pub async fn update(&self, status: &InstallationStatus) -> Result<()> {
        let api: Api<Installation> = Api::all(self.ctx.client.clone());
        let name = self.installation.name_any();

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": self.installation.resource_version(),
            },
            "status": {
                "state": status.state,
                "reason": status.reason,
                "nodesStatus": status.nodes_status,
                "conditions": status.conditions,
                "pendingCharts": status.pending_charts,
            }
        });

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_write(&format!("installation {}", name), e))?;

        debug!(installation = %name, state = %status.state, "Updated status");
        Ok(())
    }
}
