//! Release metadata and effective installation config
//!
//! Every distribution version ships a metadata document listing the runtime
//! version, downloadable artifacts, default chart configs and images. It is
//! staged in a ConfigMap so that airgapped clusters can read it without
//! network access.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{ConfigSpec, HelmExtensions, Installation};

/// Key of the metadata document inside the staging ConfigMap
pub const METADATA_KEY: &str = "metadata.json";

/// Key of the config document inside a config Secret
pub const CONFIG_SECRET_KEY: &str = "config.yaml";

/// Metadata published for one distribution version
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseMetadata {
    /// Component versions, "Kubernetes" is the runtime version
    #[serde(default)]
    pub versions: BTreeMap<String, String>,

    /// Artifact locations by name, "k0s" is the runtime binary
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,

    /// Default chart set for the built-in addons
    #[serde(default)]
    pub configs: HelmExtensions,

    #[serde(default)]
    pub images: Vec<String>,
}

impl ReleaseMetadata {
    pub fn parse(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn kubernetes_version(&self) -> Option<&str> {
        self.versions
            .get("Kubernetes")
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn runtime_artifact(&self) -> Option<&str> {
        self.artifacts
            .get("k0s")
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Version of a default chart, empty when unknown
    pub fn chart_version(&self, name: &str) -> String {
        self.configs
            .chart(name)
            .map(|c| c.version.clone())
            .unwrap_or_default()
    }
}

/// ConfigMap name used to stage metadata for `version`
pub fn metadata_configmap_name(version: &str) -> String {
    format!("release-metadata-{}", version.replace('+', "-"))
}

/// Public location of the metadata document for `version`
pub fn metadata_url(base_url: &str, version: &str) -> String {
    format!(
        "{}/embedded-cluster-public-files/metadata/v{}.json",
        base_url.trim_end_matches('/'),
        version.trim_start_matches('v')
    )
}

/// Where release metadata is read from
pub struct MetadataSource<'a> {
    pub client: Client,
    /// Namespace the operator runs in
    pub namespace: &'a str,
    /// Public base URL; `None` when running offline
    pub base_url: Option<&'a str>,
    pub airgap: bool,
}

/// Load metadata for `version`.
///
/// Staged metadata always wins. Otherwise online clusters fetch and stage it;
/// airgapped clusters get `None` until it has been staged by other means.
pub async fn load_metadata(
    source: &MetadataSource<'_>,
    version: &str,
) -> Result<Option<ReleaseMetadata>> {
    let api: Api<ConfigMap> = Api::namespaced(source.client.clone(), source.namespace);
    let name = metadata_configmap_name(version);

    if let Some(cm) = api.get_opt(&name).await? {
        let document = cm
            .data
            .as_ref()
            .and_then(|d| d.get(METADATA_KEY))
            .ok_or_else(|| Error::NotFound(format!("{} in configmap {}", METADATA_KEY, name)))?;
        debug!(configmap = %name, "Loaded staged release metadata");
        return ReleaseMetadata::parse(document).map(Some);
    }

    if source.airgap {
        return Ok(None);
    }

    let base_url = source.base_url.ok_or_else(|| {
        Error::InvalidConfig("no metadata base URL configured for online installation".to_string())
    })?;

    let url = metadata_url(base_url, version);
    info!(url = %url, "Fetching release metadata");
    let response = reqwest::get(&url).await?.error_for_status()?;
    let document = response.text().await?;
    let metadata = ReleaseMetadata::parse(&document)?;

    stage_metadata(&api, &name, &document).await?;
    Ok(Some(metadata))
}

async fn stage_metadata(api: &Api<ConfigMap>, name: &str, document: &str) -> Result<()> {
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            METADATA_KEY.to_string(),
            document.to_string(),
        )])),
        ..Default::default()
    };
    match api.create(&PostParams::default(), &cm).await {
        Ok(_) => {
            info!(configmap = %name, "Staged release metadata");
            Ok(())
        }
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Config in effect for an installation.
///
/// A referenced config Secret supersedes the inline config.
pub async fn effective_config(
    client: Client,
    installation: &Installation,
) -> Result<Option<ConfigSpec>> {
    let Some(secret_ref) = installation.spec.config_secret.as_ref() else {
        return Ok(installation.spec.config.clone());
    };

    let api: Api<Secret> = Api::namespaced(client, &secret_ref.namespace);
    let secret = api.get_opt(&secret_ref.name).await?.ok_or_else(|| {
        Error::NotFound(format!(
            "config secret {}/{}",
            secret_ref.namespace, secret_ref.name
        ))
    })?;

    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_SECRET_KEY))
        .ok_or_else(|| {
            Error::NotFound(format!(
                "{} in secret {}/{}",
                CONFIG_SECRET_KEY,
                secret_ref.namespace,
                secret.name_any()
            ))
        })?;

    let config: ConfigSpec = serde_yaml::from_slice(&bytes.0)?;
    Ok(Some(config))
}
