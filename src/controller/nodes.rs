//! Node inventory tracking
//!
//! Diffs the live node list against the node statuses last recorded on the
//! Installation. Only the in-memory status is produced here; persisting it and
//! reporting the events is up to the caller.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;
use crate::crd::NodeStatus;

/// Label marking control plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Attributes that contribute to a node's hash
#[derive(Serialize)]
struct HashedNode<'a> {
    labels: &'a BTreeMap<String, String>,
    taints: &'a [Taint],
    capacity: Option<&'a BTreeMap<String, Quantity>>,
    kubelet_version: &'a str,
}

/// Node observed in one of the event categories
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub name: String,
    pub role: String,
    pub kubelet_version: String,
    pub labels: BTreeMap<String, String>,
}

/// Changes found by one tracking pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeEventsBatch {
    pub added: Vec<NodeEvent>,
    pub updated: Vec<NodeEvent>,
    /// Names of nodes no longer present
    pub removed: Vec<String>,
}

impl NodeEventsBatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub fn is_control_plane(node: &Node) -> bool {
    node.labels().contains_key(CONTROL_PLANE_LABEL)
}

pub fn node_role(node: &Node) -> &'static str {
    if is_control_plane(node) {
        "controller"
    } else {
        "worker"
    }
}

fn kubelet_version(node: &Node) -> &str {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.kubelet_version.as_str())
        .unwrap_or_default()
}

/// Content hash of the attributes relevant to the installation
pub fn hash_node(node: &Node) -> Result<String> {
    let hashed = HashedNode {
        labels: node.labels(),
        taints: node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_deref())
            .unwrap_or_default(),
        capacity: node.status.as_ref().and_then(|s| s.capacity.as_ref()),
        kubelet_version: kubelet_version(node),
    };
    let encoded = serde_json::to_vec(&hashed)?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

fn node_event(node: &Node) -> NodeEvent {
    NodeEvent {
        name: node.name_any(),
        role: node_role(node).to_string(),
        kubelet_version: kubelet_version(node).to_string(),
        labels: node.labels().clone(),
    }
}

/// Compare live nodes with the recorded statuses.
///
/// Returns the new name-sorted status list and the batch of changes.
/// Running it again on its own output with the same nodes yields an empty batch.
pub fn track_nodes(
    previous: &[NodeStatus],
    nodes: &[Node],
) -> Result<(Vec<NodeStatus>, NodeEventsBatch)> {
    let known: HashMap<&str, &str> = previous
        .iter()
        .map(|s| (s.name.as_str(), s.hash.as_str()))
        .collect();

    let mut batch = NodeEventsBatch::default();
    let mut statuses = Vec::with_capacity(nodes.len());

    for node in nodes {
        let name = node.name_any();
        let hash = hash_node(node)?;
        match known.get(name.as_str()) {
            None => batch.added.push(node_event(node)),
            Some(old) if *old != hash => batch.updated.push(node_event(node)),
            Some(_) => {}
        }
        statuses.push(NodeStatus { name, hash });
    }

    statuses.sort();
    statuses.dedup_by(|a, b| a.name == b.name);

    for status in previous {
        if statuses.binary_search_by(|s| s.name.cmp(&status.name)).is_err() {
            batch.removed.push(status.name.clone());
        }
    }

    Ok((statuses, batch))
}
