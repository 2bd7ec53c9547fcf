pub mod addons;
pub mod cli;
pub mod config;
pub mod controller;
pub mod crd;
pub mod ha;
pub mod health;
pub mod release;
pub mod reporting;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, Result, error_policy, reconcile};
pub use crd::{Chart, ClusterConfig, Installation, Plan};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use crate::crd::CLUSTER_CONFIG_NAMESPACE;

/// Reference to the newest Installation in the controller's cache.
///
/// Node, Plan and Chart changes all concern the cluster as a whole, so they
/// are routed to the Installation that is currently authoritative.
fn latest_installation(store: &Store<Installation>) -> Option<ObjectRef<Installation>> {
    store
        .state()
        .into_iter()
        .max_by_key(|i| i.name_any())
        .map(|i| ObjectRef::from_obj(i.as_ref()))
}

/// Run the Installation controller.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    tracing::info!("Starting controller for Installation resources");

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let installations: Api<Installation> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let plans: Api<Plan> = Api::all(client.clone());
    let charts: Api<Chart> = Api::namespaced(client.clone(), CLUSTER_CONFIG_NAMESPACE);

    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(installations, watcher_config.clone());
    let store = controller.store();
    let (node_store, plan_store, chart_store) = (store.clone(), store.clone(), store);

    controller
        .watches(nodes, watcher_config.clone(), move |_: Node| {
            latest_installation(&node_store)
        })
        .watches(plans, watcher_config.clone(), move |_: Plan| {
            latest_installation(&plan_store)
        })
        .watches(charts, watcher_config, move |_: Chart| {
            latest_installation(&chart_store)
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists: {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("Controller stream ended unexpectedly");
}
