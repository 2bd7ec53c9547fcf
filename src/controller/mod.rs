pub mod charts;
pub mod cleanup;
pub mod coalesce;
pub mod context;
pub mod error;
pub mod nodes;
pub mod reconciler;
pub mod registry;
pub mod state_machine;
pub mod status;
pub mod upgrade;
pub mod version;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{error_policy, reconcile};
pub use state_machine::{InstallationEvent, InstallationStateMachine, TransitionContext};
pub use status::{ConditionBuilder, StatusManager, StatusSnapshot, apply_event};
