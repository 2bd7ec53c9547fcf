use clap::{Args, Parser, Subcommand};

use crate::addons::ProxySpec;
use crate::ha::EnableHaOptions;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "installation-operator",
    version,
    about = "Reconciles and upgrades a cluster installation in place"
)]
pub struct Cli {
    /// Run a one-shot task instead of the controller
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Migrate to a highly available control plane and exit
    EnableHa(EnableHaArgs),
    /// Block until the runtime upgrade plan finishes
    WaitUpgrade,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableHaArgs {
    /// Skip steps that need registry access from outside the cluster
    #[arg(long, env = "HA_AIRGAP")]
    pub airgap: bool,

    #[arg(long, env = "HA_SERVICE_CIDR")]
    pub service_cidr: Option<String>,

    #[arg(long, env = "HTTP_PROXY")]
    pub http_proxy: Option<String>,

    #[arg(long, env = "HTTPS_PROXY")]
    pub https_proxy: Option<String>,

    #[arg(long, env = "NO_PROXY")]
    pub no_proxy: Option<String>,
}

impl EnableHaArgs {
    pub fn options(&self) -> EnableHaOptions {
        let non_empty = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());
        let proxy = ProxySpec {
            http_proxy: non_empty(&self.http_proxy),
            https_proxy: non_empty(&self.https_proxy),
            no_proxy: non_empty(&self.no_proxy),
        };
        EnableHaOptions {
            airgap: self.airgap,
            service_cidr: non_empty(&self.service_cidr),
            proxy: (proxy != ProxySpec::default()).then_some(proxy),
            config_override: None,
        }
    }
}
