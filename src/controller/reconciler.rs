//! Reconciliation logic for Installation resources
//!
//! Any watched change lands here. The pass always works on the authoritative
//! Installation, whichever object triggered it, and is the only place that
//! persists Installation status.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::addons::AddonOptions;
use crate::controller::charts::{BuiltInCharts, builtin_charts, combine_helm, reconcile_charts};
use crate::controller::cleanup::cleanup_stuck_pods;
use crate::controller::coalesce::{Coalesced, coalesce_installations, mark_obsolete};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::nodes::track_nodes;
use crate::controller::registry::{ensure_s3_secret, reconcile_ha_condition};
use crate::controller::state_machine::{InstallationEvent, TransitionContext};
use crate::controller::status::{StatusManager, StatusSnapshot, apply_event};
use crate::controller::upgrade::{UpgradeInput, reconcile_upgrade};
use crate::controller::version::same_release;
use crate::crd::{ConfigSpec, Installation, InstallationStatus};
use crate::release::{MetadataSource, ReleaseMetadata, effective_config, load_metadata};
use crate::reporting::{
    EventReporter, ReportContext, installation_events_url, report_installation_events,
    report_node_events, reporter_for,
};

/// Requeue delay when the pass was skipped for another operator version
const VERSION_MISMATCH_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue delay after a write lost a concurrent update
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(5);

/// Main reconciliation function
#[instrument(skip(installation, ctx), fields(trigger = %installation.name_any()))]
pub async fn reconcile(installation: Arc<Installation>, ctx: Arc<Context>) -> Result<Action> {
    let trigger = installation.name_any();
    let start = Instant::now();

    match reconcile_installations(&ctx).await {
        Ok(outcome) => {
            ctx.reset_failures(&trigger);
            if let PassOutcome::Reconciled(name) = &outcome
                && let Some(state) = &ctx.health_state
            {
                state
                    .metrics
                    .record_reconcile(name, start.elapsed().as_secs_f64());
                state.mark_reconciled();
            }
            Ok(match outcome {
                PassOutcome::Reconciled(_) => Action::requeue(ctx.config.requeue_interval),
                PassOutcome::VersionMismatch => Action::requeue(VERSION_MISMATCH_REQUEUE),
                PassOutcome::Idle => Action::await_change(),
            })
        }
        Err(e) => {
            if let Some(action) = conflict_action(&e) {
                debug!("Write conflict, retrying with fresh state: {}", e);
                return Ok(action);
            }
            error!("Reconciliation failed: {}", e);
            if let Some(state) = &ctx.health_state {
                state.metrics.record_error(&trigger);
            }
            Err(e)
        }
    }
}

/// Short requeue for a write conflict, `None` for any other error.
///
/// A conflict only means another writer got there first; it is not counted
/// as a failure and does not go through the error backoff.
pub fn conflict_action(error: &Error) -> Option<Action> {
    error.is_conflict().then(|| Action::requeue(CONFLICT_REQUEUE))
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(installation: Arc<Installation>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = installation.name_any();
    let attempt = ctx.record_failure(&name);
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

fn record_state_metrics(ctx: &Context, installations: &[Installation]) {
    let Some(state) = &ctx.health_state else {
        return;
    };
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for installation in installations {
        *counts.entry(installation.state().to_string()).or_default() += 1;
    }
    state.metrics.set_installation_states(&counts);
}

/// Result of one reconcile pass
enum PassOutcome {
    Reconciled(String),
    /// The record belongs to another operator version
    VersionMismatch,
    /// No record, or only terminal ones
    Idle,
}

/// Reconcile the authoritative Installation
async fn reconcile_installations(ctx: &Context) -> Result<PassOutcome> {
    let api: Api<Installation> = Api::all(ctx.client.clone());
    let installations = api.list(&ListParams::default()).await?.items;
    record_state_metrics(ctx, &installations);

    // Taken before coalescing so inherited node statuses count as a change.
    let snapshot = installations
        .iter()
        .max_by(|a, b| a.name_any().cmp(&b.name_any()))
        .map(StatusSnapshot::capture);

    let (Some(coalesced), Some(snapshot)) = (coalesce_installations(installations), snapshot)
    else {
        debug!("No installation to reconcile");
        return Ok(PassOutcome::Idle);
    };

    let name = coalesced.current.name_any();
    if coalesced.current.state().is_terminal() {
        debug!(installation = %name, state = %coalesced.current.state(), "Installation is terminal");
        return Ok(PassOutcome::Idle);
    }

    if reconcile_current(ctx, coalesced, snapshot).await? {
        Ok(PassOutcome::Reconciled(name))
    } else {
        Ok(PassOutcome::VersionMismatch)
    }
}

/// Outcome of resolving the config in effect
enum ResolvedConfig {
    Ready(Option<ConfigSpec>),
    Invalid(String),
}

async fn resolve_config(ctx: &Context, installation: &Installation) -> Result<ResolvedConfig> {
    match effective_config(ctx.client.clone(), installation).await {
        Ok(config) => Ok(ResolvedConfig::Ready(config)),
        Err(e @ (Error::NotFound(_) | Error::YamlError(_))) => {
            Ok(ResolvedConfig::Invalid(format!("Failed to read config: {}", e)))
        }
        Err(e) => Err(e),
    }
}

/// Returns false when the record was left alone for another operator version.
#[instrument(skip_all, fields(installation = %coalesced.current.name_any()))]
async fn reconcile_current(
    ctx: &Context,
    mut coalesced: Coalesced,
    snapshot: StatusSnapshot,
) -> Result<bool> {
    let installation = coalesced.current.clone();
    let name = installation.name_any();
    let mut status = installation.status.clone().unwrap_or_default();

    info!(state = %status.state, "Reconciling installation");

    let report_ctx = ReportContext {
        cluster_id: installation.spec.cluster_id.clone(),
        installation: name.clone(),
        version: installation.desired_version().unwrap_or_default().to_string(),
    };
    let metrics_url = installation.spec.metrics_base_url.as_deref();
    let node_reporter = reporter_for(metrics_url);
    let reporter = reporter_for(installation_events_url(metrics_url, installation.spec.air_gap));
    let reporting = (reporter.as_ref(), &report_ctx);

    let config = match resolve_config(ctx, &installation).await? {
        ResolvedConfig::Ready(config) => config,
        ResolvedConfig::Invalid(reason) => {
            warn!("{}", reason);
            apply_event(
                &mut status,
                InstallationEvent::ValidationFailed,
                &TransitionContext::default(),
                &reason,
                Vec::new(),
            );
            finish_pass(ctx, &installation, &mut coalesced, &snapshot, &status, reporting).await?;
            return Ok(true);
        }
    };
    let desired_version = config
        .as_ref()
        .map(|c| c.version.as_str())
        .filter(|v| !v.is_empty());

    if let Some(version) = desired_version {
        if !same_release(version, &ctx.config.operator_version) {
            info!(
                desired = version,
                operator = %ctx.config.operator_version,
                "Installation targets another operator version, skipping"
            );
            return Ok(false);
        }
    }

    // Nodes
    let node_api: Api<Node> = Api::all(ctx.client.clone());
    let nodes = node_api.list(&ListParams::default()).await?.items;
    let (nodes_status, batch) = track_nodes(&status.nodes_status, &nodes)?;
    status.nodes_status = nodes_status;
    if let Some(state) = &ctx.health_state {
        state.metrics.set_tracked_nodes(status.nodes_status.len() as i64);
    }

    if !batch.is_empty() {
        report_node_events(node_reporter.as_ref(), &report_ctx, &batch).await;
    }

    // Runtime upgrade
    let source = MetadataSource {
        client: ctx.client.clone(),
        namespace: &ctx.config.namespace,
        base_url: ctx
            .config
            .metadata_base_url
            .as_deref()
            .or(installation.spec.metrics_base_url.as_deref()),
        airgap: installation.spec.air_gap,
    };
    let metadata = match desired_version {
        Some(version) => load_metadata(&source, version).await?,
        None => None,
    };
    reconcile_upgrade(
        &installation,
        &mut status,
        UpgradeInput {
            client: ctx.client.clone(),
            source: &source,
            release: metadata.as_ref(),
            previous: coalesced.previous(),
            desired_version,
            nodes: &nodes,
        },
    )
    .await?;

    if status.state.runtime_converged() {
        reconcile_workloads(
            ctx,
            &installation,
            config.as_ref(),
            desired_version,
            metadata.as_ref(),
            &nodes,
            &mut status,
        )
        .await?;
    } else {
        debug!(state = %status.state, "Runtime not converged yet");
    }

    finish_pass(
        ctx,
        &installation,
        &mut coalesced,
        &snapshot,
        &status,
        reporting,
    )
    .await?;
    Ok(true)
}

/// Everything that runs once the runtime version has converged
async fn reconcile_workloads(
    ctx: &Context,
    installation: &Installation,
    config: Option<&ConfigSpec>,
    desired_version: Option<&str>,
    metadata: Option<&ReleaseMetadata>,
    nodes: &[Node],
    status: &mut InstallationStatus,
) -> Result<()> {
    let live: HashSet<String> = nodes.iter().map(|n| n.name_any()).collect();
    match cleanup_stuck_pods(ctx.client.clone(), &live).await {
        Ok(0) => {}
        Ok(deleted) => info!(deleted, "Removed pods stuck on missing nodes"),
        Err(e) => warn!("Failed to clean up stuck pods: {}", e),
    }

    let airgap = installation.spec.air_gap;
    let ha = installation.spec.high_availability;
    if airgap && ha {
        ensure_s3_secret(ctx.client.clone()).await?;
    }

    let opts = AddonOptions {
        airgap,
        high_availability: ha,
        disaster_recovery: installation.disaster_recovery_enabled(),
        service_cidr: installation.service_cidr().map(str::to_string),
        proxy: None,
        overrides: Vec::new(),
    };
    let defaults = match builtin_charts(desired_version, metadata, &opts) {
        Ok(BuiltInCharts::Ready(defaults)) => defaults,
        Ok(BuiltInCharts::Unmanaged) => {
            apply_event(
                status,
                InstallationEvent::AddonsConverged,
                &TransitionContext::default(),
                "Installed",
                Vec::new(),
            );
            return Ok(());
        }
        Ok(BuiltInCharts::MetadataMissing) => {
            warn!("Release metadata is not available, leaving charts unchanged");
            return Ok(());
        }
        Err(Error::ValidationError(reason)) => {
            apply_event(
                status,
                InstallationEvent::ValidationFailed,
                &TransitionContext::default(),
                &reason,
                Vec::new(),
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let vendor = config.and_then(|c| c.extensions.helm.as_ref());
    let vendor_overrides = config
        .map(|c| c.unsupported_overrides.built_in_extensions.as_slice())
        .unwrap_or_default();
    let combined = combine_helm(
        &defaults,
        vendor,
        vendor_overrides,
        &installation.spec.end_user_overrides,
    )?;
    reconcile_charts(ctx.client.clone(), status, combined).await?;

    reconcile_ha_condition(
        ctx.client.clone(),
        ha,
        airgap,
        installation.metadata.generation,
        status,
    )
    .await
}

/// Persist the status, supersede older records and send installation events
async fn finish_pass(
    ctx: &Context,
    installation: &Installation,
    coalesced: &mut Coalesced,
    snapshot: &StatusSnapshot,
    status: &InstallationStatus,
    (reporter, report_ctx): (&dyn EventReporter, &ReportContext),
) -> Result<()> {
    if snapshot.changed(status) {
        StatusManager::new(installation, ctx).update(status).await?;
    } else {
        debug!("Status unchanged");
    }

    for older in coalesced.older.iter_mut() {
        if !mark_obsolete(older) {
            continue;
        }
        let Some(older_status) = older.status.clone() else {
            continue;
        };
        match StatusManager::new(older, ctx).update(&older_status).await {
            Ok(()) => info!(installation = %older.name_any(), "Marked installation obsolete"),
            Err(e) if e.is_conflict() => {
                debug!(installation = %older.name_any(), "Conflict marking installation obsolete");
            }
            Err(e) => warn!(installation = %older.name_any(), "Failed to mark obsolete: {}", e),
        }
    }

    let reports = snapshot.reports(status);
    report_installation_events(reporter, report_ctx, &reports).await;
    Ok(())
}
