//! High availability enablement
//!
//! Moving a cluster to HA is an operator action rather than part of the watch
//! loop. Every step is idempotent so an interrupted run can simply be started
//! again: installs of existing releases are no-ops and re-uploading registry
//! objects overwrites them.

pub mod migration;

pub use migration::{
    MigrationError, ObjectBody, ObjectStore, ProgressTracker, S3ObjectStore, copy_archive,
    migrate_registry_data,
};

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{info, instrument};

use crate::addons::{
    Addon, AddonOptions, ChartResourceClient, HelmClient, ProxySpec, SEAWEEDFS_NAMESPACE,
    seaweedfs_s3_endpoint,
};
use crate::config::OperatorConfig;
use crate::controller::coalesce::coalesce_installations;
use crate::controller::error::Error;
use crate::controller::nodes::is_control_plane;
use crate::controller::registry::{ensure_s3_secret, statefulsets_ready};
use crate::controller::status::{ConditionBuilder, FIELD_MANAGER};
use crate::crd::{ConfigSpec, Installation};
use crate::release::{MetadataSource, load_metadata};

/// ConfigMap present while a disaster recovery restore is running
pub const RESTORE_STATE_CONFIGMAP: &str = "disaster-recovery-state";

/// Control plane nodes required before HA can be enabled
pub const MIN_CONTROLLERS: usize = 3;

const STORE_READY_TIMEOUT: Duration = Duration::from_secs(600);
const STORE_READY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum HaError {
    #[error("High availability is already enabled")]
    AlreadyEnabled,

    #[error("High availability requires at least 3 controller nodes, found {0}")]
    NotEnoughControllers(usize),

    #[error("A disaster recovery restore is in progress")]
    RestoreInProgress,

    #[error("No installation found")]
    NoInstallation,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Controller(#[from] Error),

    #[error("Registry migration failed: {0}")]
    Migration(#[from] MigrationError),
}

/// Check whether HA may be enabled.
///
/// Checked in order: HA already on, control plane size, running restore.
pub fn check_ha_preconditions(
    ha_enabled: bool,
    control_plane_nodes: usize,
    restore_in_progress: bool,
) -> Result<(), HaError> {
    if ha_enabled {
        return Err(HaError::AlreadyEnabled);
    }
    if control_plane_nodes < MIN_CONTROLLERS {
        return Err(HaError::NotEnoughControllers(control_plane_nodes));
    }
    if restore_in_progress {
        return Err(HaError::RestoreInProgress);
    }
    Ok(())
}

/// Inputs of an HA enablement run
#[derive(Clone, Debug, Default)]
pub struct EnableHaOptions {
    pub airgap: bool,
    pub service_cidr: Option<String>,
    pub proxy: Option<ProxySpec>,
    /// Config whose built-in overrides are applied to the upgraded addons
    pub config_override: Option<ConfigSpec>,
}

/// Progress of an HA enablement run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaProgress {
    Step(String),
    MigrationPercent(u8),
}

/// Callback receiving [`HaProgress`] updates
pub type ProgressFn = Arc<dyn Fn(HaProgress) + Send + Sync>;

async fn latest_installation(client: &Client) -> Result<Installation, HaError> {
    let api: Api<Installation> = Api::all(client.clone());
    let items = api.list(&ListParams::default()).await?.items;
    coalesce_installations(items)
        .map(|c| c.current)
        .ok_or(HaError::NoInstallation)
}

async fn control_plane_count(client: &Client) -> Result<usize, HaError> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes = api.list(&ListParams::default()).await?.items;
    Ok(nodes.iter().filter(|n| is_control_plane(n)).count())
}

async fn restore_in_progress(client: &Client, namespace: &str) -> Result<bool, HaError> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(RESTORE_STATE_CONFIGMAP).await?.is_some())
}

async fn wait_for_object_store(client: &Client) -> Result<(), HaError> {
    let wait = async {
        loop {
            if statefulsets_ready(client.clone(), SEAWEEDFS_NAMESPACE).await? {
                return Ok::<(), HaError>(());
            }
            tokio::time::sleep(STORE_READY_INTERVAL).await;
        }
    };
    tokio::time::timeout(STORE_READY_TIMEOUT, wait)
        .await
        .map_err(|_| HaError::Timeout("object store did not become ready".to_string()))?
}

async fn set_migration_condition(
    client: &Client,
    installation: &Installation,
) -> Result<(), HaError> {
    let api: Api<Installation> = Api::all(client.clone());
    let name = installation.name_any();
    let latest = api.get(&name).await?;
    let existing = latest.status.map(|s| s.conditions).unwrap_or_default();
    let conditions = ConditionBuilder::from_existing(existing, latest.metadata.generation)
        .registry_migration(true, "MigrationComplete", "Registry data migrated")
        .build();

    let patch = serde_json::json!({
        "metadata": { "resourceVersion": latest.metadata.resource_version },
        "status": { "conditions": conditions },
    });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::from_write(&format!("installation {}", name), e))?;
    Ok(())
}

async fn mark_ha_enabled(client: &Client, installation: &Installation) -> Result<(), HaError> {
    let api: Api<Installation> = Api::all(client.clone());
    let patch = serde_json::json!({ "spec": { "highAvailability": true } });
    api.patch(
        &installation.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Enable high availability on the cluster.
///
/// Airgapped clusters first get the replicated object store, have their
/// registry data copied into it and the registry switched over. The admin
/// console is then upgraded to its HA values and the installation flagged.
/// Any failing step aborts the run.
#[instrument(skip_all, fields(airgap = opts.airgap))]
pub async fn enable_ha(
    client: Client,
    config: &OperatorConfig,
    opts: EnableHaOptions,
    progress: ProgressFn,
) -> Result<(), HaError> {
    let installation = latest_installation(&client).await?;
    check_ha_preconditions(
        installation.spec.high_availability,
        control_plane_count(&client).await?,
        restore_in_progress(&client, &config.namespace).await?,
    )?;

    let version = installation.desired_version().ok_or_else(|| {
        Error::ValidationError("installation has no desired version".to_string())
    })?;
    let source = MetadataSource {
        client: client.clone(),
        namespace: &config.namespace,
        base_url: config.metadata_base_url.as_deref(),
        airgap: opts.airgap,
    };
    let metadata = load_metadata(&source, version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("release metadata for {}", version)))?;

    let mut overrides = opts
        .config_override
        .as_ref()
        .map(|c| c.unsupported_overrides.built_in_extensions.clone())
        .unwrap_or_default();
    overrides.extend(installation.spec.end_user_overrides.iter().cloned());

    let addon_opts = AddonOptions {
        airgap: opts.airgap,
        high_availability: true,
        disaster_recovery: installation.disaster_recovery_enabled(),
        service_cidr: opts.service_cidr.clone(),
        proxy: opts.proxy.clone(),
        overrides,
    };
    let helm = ChartResourceClient::new(client.clone());
    let helm: &dyn HelmClient = &helm;

    if opts.airgap {
        let cidr = opts.service_cidr.as_deref().ok_or_else(|| {
            Error::InvalidConfig("service CIDR is required for airgap HA".to_string())
        })?;

        progress(HaProgress::Step("Installing object store".to_string()));
        Addon::Seaweedfs.install(helm, &metadata, &addon_opts).await?;
        wait_for_object_store(&client).await?;

        progress(HaProgress::Step("Migrating registry data".to_string()));
        let credentials = ensure_s3_secret(client.clone()).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(
            &seaweedfs_s3_endpoint(cidr)?,
            &credentials.access_key,
            &credentials.secret_key,
        ));
        let reporter = progress.clone();
        migrate_registry_data(client.clone(), store, move |percent| {
            reporter(HaProgress::MigrationPercent(percent))
        })
        .await?;
        set_migration_condition(&client, &installation).await?;

        progress(HaProgress::Step("Enabling high availability for the registry".to_string()));
        Addon::Registry.upgrade(helm, &metadata, &addon_opts).await?;
    }

    progress(HaProgress::Step("Enabling high availability for the admin console".to_string()));
    Addon::AdminConsole.upgrade(helm, &metadata, &addon_opts).await?;

    mark_ha_enabled(&client, &installation).await?;
    info!(installation = %installation.name_any(), "High availability enabled");
    Ok(())
}
