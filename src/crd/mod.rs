mod chart;
mod cluster_config;
mod installation;
mod plan;

pub use chart::*;
pub use cluster_config::*;
pub use installation::*;
pub use plan::*;
