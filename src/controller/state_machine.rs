//! Finite state machine for the Installation lifecycle
//!
//! Every status change made during a reconcile pass goes through this table,
//! so an event that does not apply to the current state leaves it untouched.

use std::fmt;

use crate::crd::InstallationState;

/// Events that trigger state transitions in the installation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallationEvent {
    /// An upgrade plan exists but has not been scheduled
    PlanQueued,
    /// The upgrade plan is being applied to the nodes
    PlanProgressing,
    /// The runtime runs the desired version
    RuntimeConverged,
    /// Something outside this record must finish first
    UpgradeDeferred,
    /// The upgrade plan reached a failure state
    UpgradeFailed,
    /// The desired state can never be reached
    ValidationFailed,
    /// New chart configuration was written
    AddonsApplied,
    /// Charts in the configuration are not yet materialized
    ChartsPending,
    /// Charts report errors and there is no drift to re-apply
    ChartsFailed,
    /// Charts match the desired configuration
    AddonsConverged,
    /// A newer Installation took over
    Superseded,
}

impl fmt::Display for InstallationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallationEvent::PlanQueued => write!(f, "PlanQueued"),
            InstallationEvent::PlanProgressing => write!(f, "PlanProgressing"),
            InstallationEvent::RuntimeConverged => write!(f, "RuntimeConverged"),
            InstallationEvent::UpgradeDeferred => write!(f, "UpgradeDeferred"),
            InstallationEvent::UpgradeFailed => write!(f, "UpgradeFailed"),
            InstallationEvent::ValidationFailed => write!(f, "ValidationFailed"),
            InstallationEvent::AddonsApplied => write!(f, "AddonsApplied"),
            InstallationEvent::ChartsPending => write!(f, "ChartsPending"),
            InstallationEvent::ChartsFailed => write!(f, "ChartsFailed"),
            InstallationEvent::AddonsConverged => write!(f, "AddonsConverged"),
            InstallationEvent::Superseded => write!(f, "Superseded"),
        }
    }
}

/// Chart signals available to transition guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Charts configured but not yet materialized
    pub pending_charts: usize,
    /// Desired chart set differs from the configured one
    pub drift: bool,
    /// Charts reporting an error
    pub chart_errors: usize,
}

impl TransitionContext {
    pub fn new(pending_charts: usize, drift: bool, chart_errors: usize) -> Self {
        Self {
            pending_charts,
            drift,
            chart_errors,
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: InstallationState,
    pub to: InstallationState,
    pub event: InstallationEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: InstallationState,
        to: InstallationState,
        event: InstallationEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: InstallationState,
        to: InstallationState,
        event: InstallationEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: InstallationState,
        event: InstallationEvent,
    },
    GuardFailed {
        from: InstallationState,
        to: InstallationState,
        event: InstallationEvent,
        reason: String,
    },
}

const UPGRADING: [InstallationState; 3] = [
    InstallationState::Waiting,
    InstallationState::Enqueued,
    InstallationState::Installing,
];

const CONVERGED: [InstallationState; 5] = [
    InstallationState::KubernetesInstalled,
    InstallationState::AddonsInstalling,
    InstallationState::PendingChartCreation,
    InstallationState::HelmChartUpdateFailure,
    InstallationState::Installed,
];

const NON_TERMINAL: [InstallationState; 8] = [
    InstallationState::Waiting,
    InstallationState::Enqueued,
    InstallationState::Installing,
    InstallationState::KubernetesInstalled,
    InstallationState::AddonsInstalling,
    InstallationState::PendingChartCreation,
    InstallationState::HelmChartUpdateFailure,
    InstallationState::Installed,
];

/// Formal state machine for the Installation lifecycle
pub struct InstallationStateMachine {
    transitions: Vec<Transition>,
}

impl Default for InstallationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallationStateMachine {
    pub fn new() -> Self {
        use InstallationEvent as E;
        use InstallationState as S;

        let mut transitions = Vec::new();

        // === Runtime upgrade ===
        for from in UPGRADING {
            transitions.push(Transition::new(from, S::Enqueued, E::PlanQueued, "Upgrade plan queued"));
            transitions.push(Transition::new(
                from,
                S::Installing,
                E::PlanProgressing,
                "Upgrade plan is being applied",
            ));
            transitions.push(Transition::new(
                from,
                S::Waiting,
                E::UpgradeDeferred,
                "Waiting before upgrading the runtime",
            ));
            transitions.push(Transition::new(
                from,
                S::KubernetesInstalled,
                E::RuntimeConverged,
                "Runtime version converged",
            ));
        }
        transitions.push(Transition::new(
            S::KubernetesInstalled,
            S::KubernetesInstalled,
            E::RuntimeConverged,
            "Runtime version converged",
        ));

        // === Charts ===
        for from in [
            S::KubernetesInstalled,
            S::PendingChartCreation,
            S::HelmChartUpdateFailure,
            S::Installed,
        ] {
            transitions.push(Transition::new(
                from,
                S::AddonsInstalling,
                E::AddonsApplied,
                "Writing new chart configuration",
            ));
        }
        for from in CONVERGED {
            transitions.push(Transition::new(
                from,
                S::PendingChartCreation,
                E::ChartsPending,
                "Waiting for charts to be created",
            ));
            transitions.push(Transition::new(
                from,
                S::HelmChartUpdateFailure,
                E::ChartsFailed,
                "Charts failed to update",
            ));
            transitions.push(Transition::new(
                from,
                S::Installed,
                E::AddonsConverged,
                "Charts converged",
            ));
        }

        // === Failures (terminal for the record) ===
        for from in NON_TERMINAL {
            transitions.push(Transition::new(from, S::Failed, E::UpgradeFailed, "Upgrade failed"));
            transitions.push(Transition::new(
                from,
                S::Failed,
                E::ValidationFailed,
                "Desired state is invalid",
            ));
        }

        // === Superseded ===
        for from in NON_TERMINAL.into_iter().chain([S::Failed]) {
            transitions.push(Transition::new(
                from,
                S::Obsolete,
                E::Superseded,
                "Superseded by a newer installation",
            ));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &InstallationState,
        event: InstallationEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &InstallationState, event: &InstallationEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &InstallationState) -> Vec<&InstallationEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            InstallationEvent::AddonsApplied if !ctx.drift => {
                Some("No chart drift to apply".to_string())
            }
            InstallationEvent::ChartsPending if ctx.pending_charts == 0 => {
                Some("No pending charts".to_string())
            }
            InstallationEvent::ChartsFailed if ctx.chart_errors == 0 => {
                Some("No chart errors".to_string())
            }
            InstallationEvent::ChartsFailed if ctx.drift => {
                Some("Chart drift takes priority over chart errors".to_string())
            }
            InstallationEvent::AddonsConverged if ctx.pending_charts > 0 || ctx.drift => Some(
                format!(
                    "Charts not converged: {} pending, drift {}",
                    ctx.pending_charts, ctx.drift
                ),
            ),
            _ => None,
        }
    }
}
