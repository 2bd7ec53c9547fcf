//! Runtime version upgrade orchestration
//!
//! Runtime upgrades are executed by the runtime's autopilot through a single
//! cluster-wide Plan object. This module decides whether a plan is needed,
//! creates it, and maps the plan's progress onto the Installation state.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::error::{Error, Result};
use crate::controller::nodes::is_control_plane;
use crate::controller::state_machine::{InstallationEvent, TransitionContext};
use crate::controller::status::apply_event;
use crate::controller::version::{KubeVersion, check_versions, upgrade_required};
use crate::crd::{
    INSTALLATION_ANNOTATION, Installation, InstallationStatus, PLAN_NAME, Plan, PlanCommand,
    PlanCommandK0sUpdate, PlanCommandTarget, PlanCommandTargetDiscovery, PlanCommandTargetStatic,
    PlanCommandTargets, PlanResourceUrl, PlanSpec, PlanState,
};
use crate::release::{MetadataSource, ReleaseMetadata, load_metadata};

/// Platform key used for the runtime artifact
pub const PLATFORM: &str = "linux-amd64";

/// Relationship between an existing plan and the installation being reconciled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanOwnership {
    /// Created by this installation to upgrade to the desired version
    Owned,
    /// Left behind by another installation, or not a version update
    Foreign,
}

/// Decide whether `plan` is this installation's version update plan.
///
/// Ownership is read from the annotation, falling back to the plan id. A plan
/// that only stages artifacts is never the version update plan.
pub fn classify_plan(plan: &Plan, installation: &str, desired_version: &str) -> PlanOwnership {
    let owner = plan
        .annotations()
        .get(INSTALLATION_ANNOTATION)
        .map(String::as_str)
        .unwrap_or(plan.spec.id.as_str());
    if owner != installation {
        return PlanOwnership::Foreign;
    }
    match plan.k0s_update() {
        Some(update) if update.version == desired_version => PlanOwnership::Owned,
        _ => PlanOwnership::Foreign,
    }
}

/// Map the state of an owned plan onto an installation event and reason
pub fn plan_event(state: PlanState) -> (InstallationEvent, String) {
    match state {
        PlanState::Completed => (
            InstallationEvent::RuntimeConverged,
            "Kubernetes upgraded".to_string(),
        ),
        PlanState::Schedulable | PlanState::SchedulableWait => (
            InstallationEvent::PlanProgressing,
            "Upgrading Kubernetes".to_string(),
        ),
        PlanState::Unscheduled | PlanState::Unknown => (
            InstallationEvent::PlanQueued,
            "Upgrade plan is waiting to be scheduled".to_string(),
        ),
        failed => (
            InstallationEvent::UpgradeFailed,
            failed
                .failure_reason()
                .unwrap_or("Upgrade plan failed")
                .to_string(),
        ),
    }
}

/// Build the version update plan for `installation`.
///
/// Every current node is targeted, controllers first.
pub fn build_plan(
    installation: &str,
    desired_version: &str,
    artifact_url: &str,
    nodes: &[Node],
    timestamp: &str,
) -> Plan {
    let mut controllers = Vec::new();
    let mut workers = Vec::new();
    for node in nodes {
        if is_control_plane(node) {
            controllers.push(node.name_any());
        } else {
            workers.push(node.name_any());
        }
    }
    controllers.sort();
    workers.sort();

    let target = |nodes: Vec<String>| PlanCommandTarget {
        discovery: PlanCommandTargetDiscovery {
            static_nodes: Some(PlanCommandTargetStatic { nodes }),
            selector: None,
        },
    };

    Plan {
        metadata: ObjectMeta {
            name: Some(PLAN_NAME.to_string()),
            annotations: Some(BTreeMap::from([(
                INSTALLATION_ANNOTATION.to_string(),
                installation.to_string(),
            )])),
            ..Default::default()
        },
        spec: PlanSpec {
            id: installation.to_string(),
            timestamp: timestamp.to_string(),
            commands: vec![PlanCommand {
                k0s_update: Some(PlanCommandK0sUpdate {
                    version: desired_version.to_string(),
                    force_update: true,
                    platforms: BTreeMap::from([(
                        PLATFORM.to_string(),
                        PlanResourceUrl {
                            url: artifact_url.to_string(),
                            sha256: None,
                        },
                    )]),
                    targets: PlanCommandTargets {
                        controllers: target(controllers),
                        workers: target(workers),
                    },
                }),
                airgap_update: None,
            }],
        },
        status: None,
    }
}

/// Poll `fetch` every `interval` until it yields a terminal plan.
///
/// There is no upper bound on the wait; callers that need one wrap this in a
/// timeout. A missing plan keeps the loop waiting.
pub async fn wait_for_plan<F, Fut>(mut fetch: F, interval: Duration) -> Result<Plan>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Plan>>>,
{
    loop {
        if let Some(plan) = fetch().await? {
            if plan.state().is_terminal() {
                return Ok(plan);
            }
            debug!(state = ?plan.state(), "Waiting for upgrade plan");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Block until the cluster's upgrade plan reaches a terminal state.
///
/// Returns the final plan state; a failed plan is not an error here.
pub async fn wait_for_upgrade(client: Client, interval: Duration) -> Result<PlanState> {
    let plans: Api<Plan> = Api::all(client);
    let plan = wait_for_plan(
        || {
            let plans = plans.clone();
            async move { plans.get_opt(PLAN_NAME).await.map_err(Error::from) }
        },
        interval,
    )
    .await?;
    Ok(plan.state())
}

/// Inputs of the upgrade phase beyond the installation itself
pub struct UpgradeInput<'a> {
    pub client: Client,
    /// Where release metadata of earlier versions is read from
    pub source: &'a MetadataSource<'a>,
    /// Release metadata of the desired version, absent until it is staged
    pub release: Option<&'a ReleaseMetadata>,
    /// The installation created right before this one
    pub previous: Option<&'a Installation>,
    /// Desired distribution version
    pub desired_version: Option<&'a str>,
    pub nodes: &'a [Node],
}

/// Whether the upgrade phase has nothing to converge.
///
/// The first installation runs the version it was installed with, and a
/// record without a version never asks for a change.
pub fn skip_upgrade(desired_version: Option<&str>, previous: Option<&Installation>) -> bool {
    desired_version.is_none() || previous.is_none()
}

/// Runtime version of the previous installation, if it can be determined
async fn previous_kube_version(
    source: &MetadataSource<'_>,
    previous: Option<&Installation>,
) -> Option<KubeVersion> {
    let version = previous?.desired_version()?;
    match load_metadata(source, version).await {
        Ok(Some(meta)) => meta
            .kubernetes_version()
            .and_then(|v| KubeVersion::parse(v).ok()),
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to load metadata of previous installation: {}", e);
            None
        }
    }
}

/// Run the upgrade phase, recording its outcome on `status`
#[instrument(skip_all, fields(installation = %installation.name_any()))]
pub async fn reconcile_upgrade(
    installation: &Installation,
    status: &mut InstallationStatus,
    input: UpgradeInput<'_>,
) -> Result<()> {
    let ctx = TransitionContext::default();

    if skip_upgrade(input.desired_version, input.previous) {
        apply_event(
            status,
            InstallationEvent::RuntimeConverged,
            &ctx,
            "Kubernetes installed",
            Vec::new(),
        );
        return Ok(());
    }

    if status.state.runtime_converged() {
        return Ok(());
    }

    let Some(metadata) = input.release else {
        apply_event(
            status,
            InstallationEvent::UpgradeDeferred,
            &ctx,
            "Waiting for release metadata to be staged",
            Vec::new(),
        );
        return Ok(());
    };

    let Some(desired_kube) = metadata.kubernetes_version() else {
        apply_event(
            status,
            InstallationEvent::ValidationFailed,
            &ctx,
            "Release metadata has no Kubernetes version",
            Vec::new(),
        );
        return Ok(());
    };

    let server = input.client.apiserver_version().await?;
    let (desired, running) = match check_versions(desired_kube, &server.git_version) {
        Ok(versions) => versions,
        Err(reason) => {
            apply_event(status, InstallationEvent::ValidationFailed, &ctx, &reason, Vec::new());
            return Ok(());
        }
    };

    let name = installation.name_any();
    let plans: Api<Plan> = Api::all(input.client.clone());

    if let Some(plan) = plans.get_opt(PLAN_NAME).await? {
        match classify_plan(&plan, &name, desired_kube) {
            PlanOwnership::Owned => {
                let (event, reason) = plan_event(plan.state());
                apply_event(status, event, &ctx, &reason, Vec::new());
            }
            PlanOwnership::Foreign if plan.state().is_terminal() => {
                info!(plan = %plan.spec.id, "Deleting upgrade plan left by a previous installation");
                match plans.delete(PLAN_NAME, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
                apply_event(
                    status,
                    InstallationEvent::UpgradeDeferred,
                    &ctx,
                    "Removed a previous upgrade plan",
                    Vec::new(),
                );
            }
            PlanOwnership::Foreign => {
                apply_event(
                    status,
                    InstallationEvent::UpgradeDeferred,
                    &ctx,
                    "Waiting for a previous upgrade to finish",
                    Vec::new(),
                );
            }
        }
        return Ok(());
    }

    let previous = previous_kube_version(input.source, input.previous).await;
    if !upgrade_required(&desired, &running, previous.as_ref()) {
        apply_event(
            status,
            InstallationEvent::RuntimeConverged,
            &ctx,
            "Kubernetes already at the desired version",
            Vec::new(),
        );
        return Ok(());
    }

    let Some(artifact) = metadata.runtime_artifact() else {
        apply_event(
            status,
            InstallationEvent::ValidationFailed,
            &ctx,
            "Release metadata has no k0s artifact",
            Vec::new(),
        );
        return Ok(());
    };

    let plan = build_plan(
        &name,
        desired_kube,
        artifact,
        input.nodes,
        &Utc::now().to_rfc3339(),
    );
    match plans.create(&PostParams::default(), &plan).await {
        Ok(_) => info!(from = %running, to = %desired, "Created upgrade plan"),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            debug!("Upgrade plan created concurrently");
        }
        Err(e) => return Err(e.into()),
    }
    apply_event(
        status,
        InstallationEvent::PlanQueued,
        &ctx,
        "Upgrade plan created",
        Vec::new(),
    );

    Ok(())
}
