//! Removal of pods stuck terminating on nodes that no longer exist
//!
//! A pod scheduled to a node that was removed keeps its deletion timestamp
//! forever because no kubelet will ever confirm the termination.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::error::Result;

/// Namespace and name of a pod to force delete
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StuckPod {
    pub namespace: String,
    pub name: String,
    pub node: String,
}

/// Pods being deleted whose node is not in `live_nodes`
pub fn stuck_pods(pods: &[Pod], live_nodes: &HashSet<String>) -> Vec<StuckPod> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_some())
        .filter_map(|p| {
            let node = p.spec.as_ref()?.node_name.clone()?;
            if live_nodes.contains(&node) {
                return None;
            }
            Some(StuckPod {
                namespace: p.namespace().unwrap_or_default(),
                name: p.name_any(),
                node,
            })
        })
        .collect()
}

/// Force delete pods stuck on removed nodes.
///
/// Deletion failures are logged; a pod that is already gone is not an error.
pub async fn cleanup_stuck_pods(client: Client, live_nodes: &HashSet<String>) -> Result<usize> {
    let all_pods: Api<Pod> = Api::all(client.clone());
    let pods = all_pods.list(&ListParams::default()).await?;
    let stuck = stuck_pods(&pods.items, live_nodes);

    let params = DeleteParams {
        grace_period_seconds: Some(0),
        ..DeleteParams::default()
    };

    let mut deleted = 0;
    for pod in &stuck {
        let api: Api<Pod> = Api::namespaced(client.clone(), &pod.namespace);
        match api.delete(&pod.name, &params).await {
            Ok(_) => {
                info!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    node = %pod.node,
                    "Force deleted pod stuck on removed node"
                );
                deleted += 1;
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!("Pod {}/{} already gone", pod.namespace, pod.name);
            }
            Err(e) => {
                warn!("Failed to delete stuck pod {}/{}: {}", pod.namespace, pod.name, e);
            }
        }
    }

    Ok(deleted)
}
