//! Operator configuration read from the environment

use std::time::Duration;

use crate::controller::error::{Error, Result};

/// Runtime configuration of the operator process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Version of this binary; reconciles are skipped for other versions
    pub operator_version: String,
    /// Base URL release metadata is fetched from when online
    pub metadata_base_url: Option<String>,
    /// Requeue interval when nothing changed
    pub requeue_interval: Duration,
    /// Poll interval of the upgrade plan wait loop
    pub plan_poll_interval: Duration,
    pub health_port: u16,
    /// Identity used for leader election
    pub pod_name: Option<String>,
    /// Namespace the operator runs in
    pub namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata_base_url: None,
            requeue_interval: Duration::from_secs(3600),
            plan_poll_interval: Duration::from_secs(5),
            health_port: 8080,
            pod_name: None,
            namespace: "embedded-cluster".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            operator_version: var("OPERATOR_VERSION").unwrap_or(defaults.operator_version),
            metadata_base_url: var("METADATA_BASE_URL"),
            requeue_interval: match var("REQUEUE_INTERVAL_SECS") {
                Some(v) => Duration::from_secs(parse_number("REQUEUE_INTERVAL_SECS", &v)?),
                None => defaults.requeue_interval,
            },
            plan_poll_interval: match var("PLAN_POLL_INTERVAL_SECS") {
                Some(v) => Duration::from_secs(parse_number("PLAN_POLL_INTERVAL_SECS", &v)?),
                None => defaults.plan_poll_interval,
            },
            health_port: match var("HEALTH_PORT") {
                Some(v) => parse_number("HEALTH_PORT", &v)?,
                None => defaults.health_port,
            },
            pod_name: var("POD_NAME"),
            namespace: var("POD_NAMESPACE").unwrap_or(defaults.namespace),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{} must be a number, got {:?}", key, value)))
}
