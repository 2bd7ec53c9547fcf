//! Selection of the authoritative Installation
//!
//! Installation names sort chronologically. The greatest name wins; when it
//! has no node statuses yet it inherits them from the newest older record
//! that has some. Every other record is superseded.

use kube::ResourceExt;

use crate::controller::state_machine::{InstallationEvent, TransitionContext};
use crate::controller::status::apply_event;
use crate::crd::{Installation, InstallationStatus};

/// Reason recorded on superseded records
pub const OBSOLETE_REASON: &str = "This is not the most recent installation object";

/// Result of coalescing all Installation records
#[derive(Clone, Debug)]
pub struct Coalesced {
    /// The record to reconcile, with node statuses merged in
    pub current: Installation,
    /// Older records, newest first
    pub older: Vec<Installation>,
}

impl Coalesced {
    /// The record created right before the current one
    pub fn previous(&self) -> Option<&Installation> {
        self.older.first()
    }
}

fn has_nodes(installation: &Installation) -> bool {
    installation
        .status
        .as_ref()
        .is_some_and(|s| !s.nodes_status.is_empty())
}

/// Pick the authoritative record. Returns `None` when there are no records.
pub fn coalesce_installations(mut installations: Vec<Installation>) -> Option<Coalesced> {
    installations.sort_by(|a, b| b.name_any().cmp(&a.name_any()));
    let mut iter = installations.into_iter();
    let mut current = iter.next()?;
    let older: Vec<Installation> = iter.collect();

    if !has_nodes(&current) {
        if let Some(source) = older.iter().find(|i| has_nodes(i)) {
            let nodes = source
                .status
                .as_ref()
                .map(|s| s.nodes_status.clone())
                .unwrap_or_default();
            current
                .status
                .get_or_insert_with(InstallationStatus::default)
                .nodes_status = nodes;
        }
    }

    Some(Coalesced { current, older })
}

/// Mark a superseded record obsolete and drop its node statuses.
///
/// Returns false when there was nothing to change.
pub fn mark_obsolete(installation: &mut Installation) -> bool {
    let status = installation
        .status
        .get_or_insert_with(InstallationStatus::default);
    let had_nodes = !status.nodes_status.is_empty();
    status.nodes_status.clear();
    let superseded = apply_event(
        status,
        InstallationEvent::Superseded,
        &TransitionContext::default(),
        OBSOLETE_REASON,
        Vec::new(),
    );
    superseded || had_nodes
}
