use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::status::FIELD_MANAGER;
use crate::crd::{CHART_NAME_PREFIX, CLUSTER_CONFIG_NAMESPACE, Chart, ChartSpec, HelmChart};

/// Installs and upgrades chart releases
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn release_exists(&self, namespace: &str, release: &str) -> Result<bool>;

    /// Install a release. Installing an existing release is a no-op.
    async fn install(&self, chart: &HelmChart) -> Result<()>;

    async fn upgrade(&self, chart: &HelmChart) -> Result<()>;
}

/// Helm client backed by the runtime's helm controller.
///
/// Releases are declared as Chart resources which the runtime installs and
/// upgrades on its own.
#[derive(Clone)]
pub struct ChartResourceClient {
    client: Client,
}

impl ChartResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<Chart> {
        Api::namespaced(self.client.clone(), CLUSTER_CONFIG_NAMESPACE)
    }

    fn resource_name(release: &str) -> String {
        format!("{}{}", CHART_NAME_PREFIX, release)
    }

    /// Chart resource declaring `chart`
    pub fn chart_resource(chart: &HelmChart) -> Chart {
        let mut resource = Chart::new(
            &Self::resource_name(&chart.name),
            ChartSpec {
                chart_name: chart.chart_name.clone(),
                release_name: chart.name.clone(),
                values: chart.values.clone(),
                version: chart.version.clone(),
                namespace: chart.target_ns.clone(),
                timeout: chart.timeout.clone(),
                order: chart.order,
                force_upgrade: chart.force_upgrade,
            },
        );
        resource.meta_mut().namespace = Some(CLUSTER_CONFIG_NAMESPACE.to_string());
        resource
    }

    async fn apply(&self, chart: &HelmChart) -> Result<()> {
        let resource = Self::chart_resource(chart);
        let name = Self::resource_name(&chart.name);
        self.api()
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&resource),
            )
            .await?;
        debug!("Applied chart resource: {}", name);
        Ok(())
    }
}

#[async_trait]
impl HelmClient for ChartResourceClient {
    async fn release_exists(&self, _namespace: &str, release: &str) -> Result<bool> {
        Ok(self
            .api()
            .get_opt(&Self::resource_name(release))
            .await
            .map_err(Error::from)?
            .is_some())
    }

    async fn install(&self, chart: &HelmChart) -> Result<()> {
        if self.release_exists(&chart.target_ns, &chart.name).await? {
            return Ok(());
        }
        self.apply(chart).await
    }

    async fn upgrade(&self, chart: &HelmChart) -> Result<()> {
        self.apply(chart).await
    }
}
