//! Best-effort event reporting
//!
//! Installation and node lifecycle events are posted to an external metrics
//! endpoint. Failures are logged and never affect reconciliation.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::controller::nodes::{NodeEvent, NodeEventsBatch};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint returned status {0}")]
    Status(u16),
}

/// Installation level lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallationReport {
    UpgradeStarted,
    UpgradeSucceeded,
    /// Carries the failure reason
    UpgradeFailed(String),
}

impl InstallationReport {
    pub fn name(&self) -> &'static str {
        match self {
            InstallationReport::UpgradeStarted => "UpgradeStarted",
            InstallationReport::UpgradeSucceeded => "UpgradeSucceeded",
            InstallationReport::UpgradeFailed(_) => "UpgradeFailed",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstallationPayload<'a> {
    cluster_id: &'a str,
    installation: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodePayload<'a> {
    cluster_id: &'a str,
    node_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kubelet_version: Option<&'a str>,
}

/// Identity attached to every report
#[derive(Clone, Debug, Default)]
pub struct ReportContext {
    pub cluster_id: String,
    pub installation: String,
    pub version: String,
}

/// Destination for lifecycle events
#[async_trait]
pub trait EventReporter: Send + Sync {
    async fn installation_event(
        &self,
        ctx: &ReportContext,
        report: &InstallationReport,
    ) -> Result<(), ReportError>;

    async fn node_added(&self, ctx: &ReportContext, node: &NodeEvent) -> Result<(), ReportError>;

    async fn node_updated(&self, ctx: &ReportContext, node: &NodeEvent)
    -> Result<(), ReportError>;

    async fn node_removed(&self, ctx: &ReportContext, node: &str) -> Result<(), ReportError>;
}

/// Reporter that drops every event
#[derive(Clone, Debug, Default)]
pub struct NoopReporter;

#[async_trait]
impl EventReporter for NoopReporter {
    async fn installation_event(
        &self,
        _ctx: &ReportContext,
        report: &InstallationReport,
    ) -> Result<(), ReportError> {
        debug!(event = report.name(), "Event reporting disabled");
        Ok(())
    }

    async fn node_added(&self, _ctx: &ReportContext, _node: &NodeEvent) -> Result<(), ReportError> {
        Ok(())
    }

    async fn node_updated(
        &self,
        _ctx: &ReportContext,
        _node: &NodeEvent,
    ) -> Result<(), ReportError> {
        Ok(())
    }

    async fn node_removed(&self, _ctx: &ReportContext, _node: &str) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Reporter posting JSON events to `<base>/embedded_cluster_metrics/<Event>`
#[derive(Clone, Debug)]
pub struct HttpReporter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReporter {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn event_url(&self, event: &str) -> String {
        format!("{}/embedded_cluster_metrics/{}", self.base_url, event)
    }

    async fn post<T: Serialize + Sync>(&self, event: &str, payload: &T) -> Result<(), ReportError> {
        let response = self
            .client
            .post(self.event_url(event))
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn post_node(
        &self,
        event: &str,
        ctx: &ReportContext,
        name: &str,
        node: Option<&NodeEvent>,
    ) -> Result<(), ReportError> {
        let payload = NodePayload {
            cluster_id: &ctx.cluster_id,
            node_name: name,
            role: node.map(|n| n.role.as_str()),
            kubelet_version: node.map(|n| n.kubelet_version.as_str()),
        };
        self.post(event, &payload).await
    }
}

#[async_trait]
impl EventReporter for HttpReporter {
    async fn installation_event(
        &self,
        ctx: &ReportContext,
        report: &InstallationReport,
    ) -> Result<(), ReportError> {
        let reason = match report {
            InstallationReport::UpgradeFailed(reason) => Some(reason.as_str()),
            _ => None,
        };
        let payload = InstallationPayload {
            cluster_id: &ctx.cluster_id,
            installation: &ctx.installation,
            version: &ctx.version,
            reason,
        };
        self.post(report.name(), &payload).await
    }

    async fn node_added(&self, ctx: &ReportContext, node: &NodeEvent) -> Result<(), ReportError> {
        self.post_node("NodeAdded", ctx, &node.name, Some(node)).await
    }

    async fn node_updated(
        &self,
        ctx: &ReportContext,
        node: &NodeEvent,
    ) -> Result<(), ReportError> {
        self.post_node("NodeUpdated", ctx, &node.name, Some(node)).await
    }

    async fn node_removed(&self, ctx: &ReportContext, node: &str) -> Result<(), ReportError> {
        self.post_node("NodeRemoved", ctx, node, None).await
    }
}

/// Reporter for an installation: HTTP when a base URL is set, otherwise a no-op
pub fn reporter_for(base_url: Option<&str>) -> Box<dyn EventReporter> {
    match base_url.filter(|u| !u.is_empty()) {
        Some(url) => Box::new(HttpReporter::new(url)),
        None => Box::new(NoopReporter),
    }
}

/// Base URL for installation lifecycle events; air-gapped installs report none
pub fn installation_events_url(base_url: Option<&str>, airgap: bool) -> Option<&str> {
    base_url.filter(|_| !airgap)
}

/// Send every event of a node batch, logging failures
pub async fn report_node_events(
    reporter: &dyn EventReporter,
    ctx: &ReportContext,
    batch: &NodeEventsBatch,
) {
    for node in &batch.added {
        if let Err(e) = reporter.node_added(ctx, node).await {
            warn!(node = %node.name, "Failed to report node added: {}", e);
        }
    }
    for node in &batch.updated {
        if let Err(e) = reporter.node_updated(ctx, node).await {
            warn!(node = %node.name, "Failed to report node updated: {}", e);
        }
    }
    for node in &batch.removed {
        if let Err(e) = reporter.node_removed(ctx, node).await {
            warn!(node = %node, "Failed to report node removed: {}", e);
        }
    }
}

/// Send installation events, logging failures
pub async fn report_installation_events(
    reporter: &dyn EventReporter,
    ctx: &ReportContext,
    reports: &[InstallationReport],
) {
    for report in reports {
        if let Err(e) = reporter.installation_event(ctx, report).await {
            warn!(event = report.name(), "Failed to report installation event: {}", e);
        }
    }
}
