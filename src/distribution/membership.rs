//! Cluster membership as seen by the placement layer.
//!
//! Storage nodes register themselves under `/<cluster>/nodes/<node-id>` with
//! their current [`NodeState`] as data. The [`ResourceAllocator`](super::ResourceAllocator)
//! only considers nodes that are [`NodeState::Ready`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::coordination::CoordinationStore;
use super::error::{CoordinationError, RegionError, RegionResult};
use super::paths::StorePaths;

/// Identifier of a storage node, usually its `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

/// Health of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Ready,
    /// Running an older software version; kept out of placement.
    Outdated,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Ready => "ready",
            NodeState::Outdated => "outdated",
            NodeState::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ready" => Ok(NodeState::Ready),
            "outdated" => Ok(NodeState::Outdated),
            "failed" => Ok(NodeState::Failed),
            other => Err(format!("unknown node state '{other}'")),
        }
    }
}

/// A node known to the cluster together with its current load.
///
/// `load` is filled in by the allocator (number of regions the node hosts in
/// the group being placed) before a placement strategy sees the instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInstance {
    pub id: NodeId,
    pub state: NodeState,
    pub load: u64,
}

impl NodeInstance {
    pub fn new(id: impl Into<NodeId>, state: NodeState) -> Self {
        Self {
            id: id.into(),
            state,
            load: 0,
        }
    }

    pub fn ready(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeState::Ready)
    }

    pub fn with_load(mut self, load: u64) -> Self {
        self.load = load;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }
}

/// Store-backed registry of storage nodes.
#[derive(Clone)]
pub struct ClusterMembership {
    store: Arc<dyn CoordinationStore>,
    paths: StorePaths,
}

impl ClusterMembership {
    pub fn new(store: Arc<dyn CoordinationStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Register a node, replacing any previous registration.
    pub async fn register_node(&self, id: &NodeId, state: NodeState) -> RegionResult<()> {
        let path = self.paths.node_path(id)?;
        self.store
            .set_data(&path, Bytes::from(state.as_str()))
            .await?;
        info!(node = %id, state = %state, "Registered storage node");
        Ok(())
    }

    pub async fn set_node_state(&self, id: &NodeId, state: NodeState) -> RegionResult<()> {
        let path = self.paths.node_path(id)?;
        if !self.store.exists(&path).await? {
            return Err(CoordinationError::NotFound(path).into());
        }
        self.store
            .set_data(&path, Bytes::from(state.as_str()))
            .await?;
        debug!(node = %id, state = %state, "Updated storage node state");
        Ok(())
    }

    pub async fn deregister_node(&self, id: &NodeId) -> RegionResult<()> {
        let path = self.paths.node_path(id)?;
        self.store.delete_recursive(&path).await?;
        info!(node = %id, "Deregistered storage node");
        Ok(())
    }

    /// All registered nodes in id order. An empty cluster yields an empty list.
    pub async fn nodes(&self) -> RegionResult<Vec<NodeInstance>> {
        let base = self.paths.nodes_path();
        let names = match self.store.get_children(&base).await {
            Ok(names) => names,
            Err(CoordinationError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            let path = format!("{base}/{name}");
            let data = match self.store.read_node(&path).await {
                Ok(data) => data,
                // Deregistered between listing and reading.
                Err(CoordinationError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let raw = std::str::from_utf8(&data)
                .map_err(|e| RegionError::malformed(&path, e.to_string()))?;
            let state = raw
                .parse::<NodeState>()
                .map_err(|e| RegionError::malformed(&path, e))?;
            nodes.push(NodeInstance::new(NodeId::new(name), state));
        }
        Ok(nodes)
    }

    pub async fn ready_nodes(&self) -> RegionResult<Vec<NodeInstance>> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .filter(NodeInstance::is_ready)
            .collect())
    }
}
