//! Built-in addons
//!
//! The built-in chart set is closed: each addon knows its release name,
//! namespace, install order and how to render its values for the cluster
//! topology. Release metadata supplies chart references, versions and the
//! default values every addon starts from.

mod helm;

pub use helm::{ChartResourceClient, HelmClient};

use std::net::Ipv4Addr;

use serde_json::json;
use tracing::{debug, info};

use crate::controller::charts::{apply_overrides, merge_values};
use crate::controller::error::{Error, Result};
use crate::crd::{BuiltInExtension, HelmChart, HelmExtensions};
use crate::release::ReleaseMetadata;

/// Namespace of the replicated object store
pub const SEAWEEDFS_NAMESPACE: &str = "seaweedfs";
/// Namespace of the image registry
pub const REGISTRY_NAMESPACE: &str = "registry";
/// Secret holding the object store credentials used by the registry
pub const SEAWEEDFS_S3_SECRET: &str = "seaweedfs-s3-rw";
/// Bucket registry blobs live in once migrated
pub const REGISTRY_BUCKET: &str = "registry";
/// Port of the object store S3 endpoint
pub const SEAWEEDFS_S3_PORT: u16 = 8333;

/// HTTP proxy settings passed to addons that reach the internet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxySpec {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

/// Topology the built-in charts are rendered for
#[derive(Clone, Debug, Default)]
pub struct AddonOptions {
    pub airgap: bool,
    pub high_availability: bool,
    pub disaster_recovery: bool,
    pub service_cidr: Option<String>,
    pub proxy: Option<ProxySpec>,
    /// Value patches applied last, in order
    pub overrides: Vec<BuiltInExtension>,
}

/// One built-in addon
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Addon {
    OpenEbs,
    Seaweedfs,
    Registry,
    Velero,
    AdminConsole,
    Operator,
}

/// Parse the service CIDR and return the address at `offset` from its base
pub fn service_address(service_cidr: &str, offset: u32) -> Result<Ipv4Addr> {
    let (network, prefix) = service_cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidConfig(format!("invalid service CIDR {:?}", service_cidr)))?;
    let network: Ipv4Addr = network
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid service CIDR {:?}", service_cidr)))?;
    let prefix: u32 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| Error::InvalidConfig(format!("invalid service CIDR {:?}", service_cidr)))?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let base = u32::from(network) & mask;
    Ok(Ipv4Addr::from(base.wrapping_add(offset)))
}

/// S3 endpoint of the replicated object store, the 11th service address
pub fn seaweedfs_s3_endpoint(service_cidr: &str) -> Result<String> {
    let ip = service_address(service_cidr, 11)?;
    Ok(format!("http://{}:{}", ip, SEAWEEDFS_S3_PORT))
}

/// Cluster IP of the registry service, the 10th service address
pub fn registry_address(service_cidr: &str) -> Result<String> {
    Ok(service_address(service_cidr, 10)?.to_string())
}

fn proxy_env(proxy: Option<&ProxySpec>) -> Vec<serde_json::Value> {
    let Some(proxy) = proxy else {
        return Vec::new();
    };
    [
        ("HTTP_PROXY", proxy.http_proxy.as_ref()),
        ("HTTPS_PROXY", proxy.https_proxy.as_ref()),
        ("NO_PROXY", proxy.no_proxy.as_ref()),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| json!({"name": name, "value": v})))
    .collect()
}

impl Addon {
    /// Release name
    pub fn name(&self) -> &'static str {
        match self {
            Addon::OpenEbs => "openebs",
            Addon::Seaweedfs => "seaweedfs",
            Addon::Registry => "docker-registry",
            Addon::Velero => "velero",
            Addon::AdminConsole => "admin-console",
            Addon::Operator => "embedded-cluster-operator",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            Addon::OpenEbs => "openebs",
            Addon::Seaweedfs => SEAWEEDFS_NAMESPACE,
            Addon::Registry => REGISTRY_NAMESPACE,
            Addon::Velero => "velero",
            Addon::AdminConsole => "kotsadm",
            Addon::Operator => "embedded-cluster",
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            Addon::OpenEbs => 1,
            Addon::Seaweedfs => 2,
            Addon::Registry => 3,
            Addon::Velero => 3,
            Addon::AdminConsole => 5,
            Addon::Operator => 6,
        }
    }

    /// Chart version shipped in the release
    pub fn version(&self, meta: &ReleaseMetadata) -> String {
        meta.chart_version(self.name())
    }

    /// Values this addon layers over the release defaults
    fn topology_values(&self, opts: &AddonOptions) -> Result<Option<serde_json::Value>> {
        let values = match self {
            Addon::Registry => {
                let Some(cidr) = opts.service_cidr.as_deref() else {
                    return Ok(None);
                };
                let mut values = json!({
                    "service": {"clusterIP": registry_address(cidr)?},
                });
                if opts.high_availability {
                    values["replicaCount"] = json!(2);
                    values["storage"] = json!("s3");
                    values["s3"] = json!({
                        "regionEndpoint": seaweedfs_s3_endpoint(cidr)?,
                        "bucket": REGISTRY_BUCKET,
                        "secure": false,
                    });
                    values["secrets"] = json!({"s3": {"secretRef": SEAWEEDFS_S3_SECRET}});
                }
                values
            }
            Addon::AdminConsole => json!({
                "isHA": opts.high_availability,
                "isAirgap": opts.airgap,
                "extraEnv": proxy_env(opts.proxy.as_ref()),
            }),
            Addon::Velero => {
                let env = proxy_env(opts.proxy.as_ref());
                if env.is_empty() {
                    return Ok(None);
                }
                json!({"configuration": {"extraEnvVars": env}})
            }
            Addon::OpenEbs | Addon::Seaweedfs | Addon::Operator => return Ok(None),
        };
        Ok(Some(values))
    }

    /// Render the chart for this addon
    pub fn generate_chart(&self, meta: &ReleaseMetadata, opts: &AddonOptions) -> Result<HelmChart> {
        let base = meta.configs.chart(self.name()).ok_or_else(|| {
            Error::ValidationError(format!(
                "chart {} missing from release metadata",
                self.name()
            ))
        })?;

        let mut chart = base.clone();
        chart.target_ns = self.namespace().to_string();
        chart.order = self.order();
        if let Some(values) = self.topology_values(opts)? {
            chart.values = merge_values(&chart.values, &serde_yaml::to_string(&values)?)?;
        }
        apply_overrides(std::slice::from_mut(&mut chart), &opts.overrides)?;
        Ok(chart)
    }

    /// Install the release unless it already exists
    pub async fn install(
        &self,
        helm: &dyn HelmClient,
        meta: &ReleaseMetadata,
        opts: &AddonOptions,
    ) -> Result<()> {
        if helm.release_exists(self.namespace(), self.name()).await? {
            debug!(addon = self.name(), "Release already installed");
            return Ok(());
        }
        let chart = self.generate_chart(meta, opts)?;
        info!(addon = self.name(), version = %chart.version, "Installing addon");
        helm.install(&chart).await
    }

    /// Upgrade the release to the values for `opts`
    pub async fn upgrade(
        &self,
        helm: &dyn HelmClient,
        meta: &ReleaseMetadata,
        opts: &AddonOptions,
    ) -> Result<()> {
        let chart = self.generate_chart(meta, opts)?;
        info!(addon = self.name(), version = %chart.version, "Upgrading addon");
        helm.upgrade(&chart).await
    }
}

/// Addons in install order for the given topology
pub fn addons_for(opts: &AddonOptions) -> Vec<Addon> {
    let mut addons = vec![Addon::OpenEbs];
    if opts.airgap && opts.high_availability {
        addons.push(Addon::Seaweedfs);
    }
    if opts.airgap {
        addons.push(Addon::Registry);
    }
    if opts.disaster_recovery {
        addons.push(Addon::Velero);
    }
    addons.push(Addon::AdminConsole);
    addons.push(Addon::Operator);
    addons
}

/// Built-in chart set for a release and topology.
///
/// Charts come out in install order; repositories are taken from the release.
pub fn generate_helm_defaults(meta: &ReleaseMetadata, opts: &AddonOptions) -> Result<HelmExtensions> {
    let charts = addons_for(opts)
        .iter()
        .map(|addon| addon.generate_chart(meta, opts))
        .collect::<Result<Vec<_>>>()?;

    Ok(HelmExtensions {
        repositories: meta.configs.repositories.clone(),
        charts,
        concurrency_level: meta.configs.concurrency_level,
    })
}
