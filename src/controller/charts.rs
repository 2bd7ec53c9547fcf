//! Chart lifecycle reconciliation
//!
//! Two comparisons drive the chart phase of a reconcile pass:
//!
//! - drift: the desired chart set against the chart set currently written in
//!   the runtime configuration
//! - completion: the configured chart set against the live Chart resources
//!
//! Values are compared semantically, so key order, comments and whitespace
//! never count as a difference.

use std::collections::BTreeSet;

use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde_yaml::Value as YamlValue;
use tracing::{debug, info, instrument};

use crate::addons::{AddonOptions, generate_helm_defaults};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{InstallationEvent, TransitionContext};
use crate::controller::status::apply_event;
use crate::crd::{
    BuiltInExtension, CLUSTER_CONFIG_NAME, CLUSTER_CONFIG_NAMESPACE, Chart, ClusterConfig,
    HelmChart, HelmExtensions, InstallationState, InstallationStatus,
};
use crate::release::ReleaseMetadata;

/// Longest chart failure reason stored on the status
pub const MAX_REASON_LENGTH: usize = 1024;

/// Parse a values document into a canonical JSON string.
///
/// Empty documents are equivalent to null. Object keys come out sorted.
fn canonical_values(values: &str) -> Option<String> {
    if values.trim().is_empty() {
        return Some("null".to_string());
    }
    let parsed: serde_json::Value = serde_yaml::from_str(values).ok()?;
    serde_json::to_string(&parsed).ok()
}

/// Semantic comparison of two values documents.
///
/// Falls back to a trimmed textual comparison when either side does not parse.
pub fn values_differ(a: &str, b: &str) -> bool {
    match (canonical_values(a), canonical_values(b)) {
        (Some(a), Some(b)) => a != b,
        _ => a.trim() != b.trim(),
    }
}

/// Deep merge `overlay` into `base`. Maps merge recursively, anything else
/// in the overlay replaces the base value.
fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Merge a YAML override document into a chart's values
pub fn merge_values(values: &str, overrides: &str) -> Result<String> {
    if overrides.trim().is_empty() {
        return Ok(values.to_string());
    }
    let mut base: YamlValue = if values.trim().is_empty() {
        YamlValue::Mapping(Default::default())
    } else {
        serde_yaml::from_str(values)?
    };
    let overlay: YamlValue = serde_yaml::from_str(overrides)?;
    merge_yaml(&mut base, overlay);
    Ok(serde_yaml::to_string(&base)?)
}

/// Merge each override into the values of the chart it names
pub fn apply_overrides(charts: &mut [HelmChart], overrides: &[BuiltInExtension]) -> Result<()> {
    for chart in charts.iter_mut() {
        for patch in overrides.iter().filter(|o| o.name == chart.name) {
            chart.values = merge_values(&chart.values, &patch.values)?;
        }
    }
    Ok(())
}

/// Build the desired chart set.
///
/// Precedence, lowest first: built-in defaults, vendor charts (replace by
/// name), vendor overrides of built-in values, end-user overrides.
pub fn combine_helm(
    defaults: &HelmExtensions,
    vendor: Option<&HelmExtensions>,
    vendor_overrides: &[BuiltInExtension],
    end_user_overrides: &[BuiltInExtension],
) -> Result<HelmExtensions> {
    let mut combined = defaults.clone();

    if let Some(vendor) = vendor {
        combined
            .repositories
            .extend(vendor.repositories.iter().cloned());
        for chart in &vendor.charts {
            match combined.charts.iter_mut().find(|c| c.name == chart.name) {
                Some(existing) => *existing = chart.clone(),
                None => combined.charts.push(chart.clone()),
            }
        }
        if vendor.concurrency_level > 0 {
            combined.concurrency_level = vendor.concurrency_level;
        }
    }

    apply_overrides(&mut combined.charts, vendor_overrides)?;
    apply_overrides(&mut combined.charts, end_user_overrides)?;

    combined.charts.sort_by_key(|c| c.order);
    Ok(combined)
}

/// Built-in chart set a pass starts from
#[derive(Clone, Debug, PartialEq)]
pub enum BuiltInCharts {
    /// No version is requested, so there are no charts to manage
    Unmanaged,
    /// Metadata of the desired version is not available; the configured
    /// charts must be left alone until it is
    MetadataMissing,
    Ready(HelmExtensions),
}

/// Resolve the built-in charts for `desired_version`.
///
/// Without metadata the built-in set is unknown, and comparing against an
/// empty set would remove every built-in chart from the configuration.
pub fn builtin_charts(
    desired_version: Option<&str>,
    metadata: Option<&ReleaseMetadata>,
    opts: &AddonOptions,
) -> Result<BuiltInCharts> {
    match (desired_version, metadata) {
        (None, _) => Ok(BuiltInCharts::Unmanaged),
        (Some(_), None) => Ok(BuiltInCharts::MetadataMissing),
        (Some(_), Some(meta)) => generate_helm_defaults(meta, opts).map(BuiltInCharts::Ready),
    }
}

/// Result of comparing the desired chart set with the configured one
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChartDrift {
    pub drift: bool,
    /// Charts that differ, without duplicates
    pub names: Vec<String>,
}

/// Compare the desired chart set against the currently configured one
pub fn detect_chart_drift(combined: &HelmExtensions, current: &HelmExtensions) -> ChartDrift {
    let mut result = ChartDrift {
        drift: combined.repositories.len() != current.repositories.len(),
        names: Vec::new(),
    };

    for desired in &combined.charts {
        let differs = match current.chart(&desired.name) {
            None => true,
            Some(existing) => {
                existing.version != desired.version
                    || values_differ(&existing.values, &desired.values)
            }
        };
        if differs {
            result.drift = true;
            if !result.names.contains(&desired.name) {
                result.names.push(desired.name.clone());
            }
        }
    }

    result
}

/// Partition of configured charts by their live state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChartCompletion {
    /// Matched and applied
    pub complete: Vec<String>,
    /// Matched but not yet applied
    pub incomplete: Vec<String>,
    /// Matched and reporting an error
    pub errored: Vec<String>,
    /// No live Chart resource
    pub missing: Vec<String>,
    /// Error messages of the errored charts
    pub errors: Vec<String>,
}

impl ChartCompletion {
    /// Charts still to be materialized
    pub fn pending(&self) -> Vec<String> {
        self.incomplete
            .iter()
            .chain(self.missing.iter())
            .cloned()
            .collect()
    }
}

/// Compare the configured chart set against the live Chart resources
pub fn detect_chart_completion(configured: &HelmExtensions, installed: &[Chart]) -> ChartCompletion {
    let mut result = ChartCompletion::default();

    for desired in &configured.charts {
        let Some(live) = installed.iter().find(|c| c.release_name() == desired.name) else {
            result.missing.push(desired.name.clone());
            continue;
        };

        if let Some(err) = live.status_error() {
            result.errors.push(format!("{}: {}", desired.name, err));
            result.errored.push(desired.name.clone());
            continue;
        }

        let status = live.status.clone().unwrap_or_default();
        let incomplete = values_differ(&live.spec.values, &desired.values)
            || status.values_hash.as_deref() != Some(live.spec.hash_values().as_str())
            || status.version.as_deref() != Some(desired.version.as_str());

        if incomplete {
            result.incomplete.push(desired.name.clone());
        } else {
            result.complete.push(desired.name.clone());
        }
    }

    result
}

/// Cut `reason` to at most `max` bytes on a character boundary
pub fn truncate_reason(reason: &str, max: usize) -> String {
    if reason.len() <= max {
        return reason.to_string();
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// What the chart phase should do in this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChartAction {
    /// Charts report errors and there is nothing to re-apply
    Fail(String),
    /// Everything converged
    Converged,
    /// Configured charts not yet materialized
    Pending(Vec<String>),
    /// A previous write is still taking effect
    Wait,
    /// Nothing to write
    NoChange,
    /// Write the desired configuration
    Apply,
}

/// Decide the chart phase outcome. Drift takes priority over chart errors.
pub fn decide_chart_action(
    state: InstallationState,
    drift: &ChartDrift,
    completion: &ChartCompletion,
) -> ChartAction {
    let pending = completion.pending();

    if !completion.errors.is_empty() && !drift.drift {
        let reason = format!(
            "failed to update helm charts: {}",
            completion.errors.join(",")
        );
        return ChartAction::Fail(truncate_reason(&reason, MAX_REASON_LENGTH));
    }
    if pending.is_empty() && !drift.drift {
        return ChartAction::Converged;
    }
    if !pending.is_empty() {
        return ChartAction::Pending(pending);
    }
    if state == InstallationState::AddonsInstalling {
        return ChartAction::Wait;
    }
    if !drift.drift {
        return ChartAction::NoChange;
    }
    ChartAction::Apply
}

/// Replace the chart extensions of the runtime configuration.
///
/// The write carries the resource version that was read, so a concurrent
/// change is reported as a conflict instead of being overwritten.
async fn write_cluster_config(
    api: &Api<ClusterConfig>,
    mut config: ClusterConfig,
    helm: HelmExtensions,
) -> Result<()> {
    config.set_helm(helm);
    api.replace(CLUSTER_CONFIG_NAME, &PostParams::default(), &config)
        .await
        .map_err(|e| Error::from_write("cluster config", e))?;
    Ok(())
}

/// Run the chart phase and record its outcome on `status`
#[instrument(skip_all)]
pub async fn reconcile_charts(
    client: Client,
    status: &mut InstallationStatus,
    combined: HelmExtensions,
) -> Result<()> {
    let config_api: Api<ClusterConfig> =
        Api::namespaced(client.clone(), CLUSTER_CONFIG_NAMESPACE);
    let chart_api: Api<Chart> = Api::namespaced(client, CLUSTER_CONFIG_NAMESPACE);

    let cluster_config = config_api.get(CLUSTER_CONFIG_NAME).await?;
    let current = cluster_config.helm();
    let installed = chart_api.list(&ListParams::default()).await?.items;

    let drift = detect_chart_drift(&combined, &current);
    let completion = detect_chart_completion(&current, &installed);
    let pending = completion.pending();
    let ctx = TransitionContext::new(pending.len(), drift.drift, completion.errors.len());

    debug!(
        drift = drift.drift,
        drifted = ?drift.names,
        pending = ?pending,
        errors = completion.errors.len(),
        "Compared charts"
    );

    match decide_chart_action(status.state, &drift, &completion) {
        ChartAction::Fail(reason) => {
            apply_event(status, InstallationEvent::ChartsFailed, &ctx, &reason, Vec::new());
        }
        ChartAction::Converged => {
            apply_event(
                status,
                InstallationEvent::AddonsConverged,
                &ctx,
                "Addons upgraded",
                Vec::new(),
            );
        }
        ChartAction::Pending(names) => {
            let reason = format!("Pending charts: {}", names.join(", "));
            apply_event(status, InstallationEvent::ChartsPending, &ctx, &reason, names);
        }
        ChartAction::Wait | ChartAction::NoChange => {}
        ChartAction::Apply => {
            let charts: BTreeSet<&str> = drift.names.iter().map(String::as_str).collect();
            info!(
                config = %cluster_config.name_any(),
                charts = ?charts,
                "Writing new chart configuration"
            );
            write_cluster_config(&config_api, cluster_config, combined).await?;
            apply_event(
                status,
                InstallationEvent::AddonsApplied,
                &ctx,
                "Installing addons",
                Vec::new(),
            );
        }
    }

    Ok(())
}
