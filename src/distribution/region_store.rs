//! Reading and writing region nodes in the coordination store.
//!
//! A region node is written in several steps (id, box, state, systems). It
//! only becomes visible to syncers once its mutation stamp exists, so every
//! multi-step write ends with [`RegionStore::mark_mutation_complete`].
//!
//! State transitions are unconditional writes, except `ACTIVE ↔ ACTIVE_FULL`
//! and `SPLIT ↔ SPLIT_MERGING`, which use compare-and-swap because any storage
//! node may race the coordinator on them.
//!
//! Size statistics live below the region too, but they are not structure:
//! writing them never touches the mutation stamp.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::constants::{STATISTICS_TOTAL_SIZE_NODE, STATISTICS_TOTAL_TUPLES_NODE};
use crate::hyperrectangle::Hyperrectangle;

use super::coordination::CoordinationStore;
use super::error::{CoordinationError, RegionError, RegionResult};
use super::membership::NodeId;
use super::paths::{
    bbox_path, mutation_path, parent_path, parse_child_number, region_id_path, state_path,
    statistics_path, systems_path, validate_name,
};
use super::region::{RegionId, RegionState};
use super::statistics::RegionStatistics;

/// Everything stored for one region node, children listed by number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRegion {
    pub path: String,
    pub id: RegionId,
    pub bounding_box: Hyperrectangle,
    pub state: RegionState,
    pub systems: BTreeSet<NodeId>,
    pub mutation_version: u64,
    /// Child numbers present in the store, complete or not.
    pub child_numbers: Vec<u32>,
}

#[derive(Clone)]
pub struct RegionStore {
    store: Arc<dyn CoordinationStore>,
}

impl RegionStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a new region node. The node stays invisible until its mutation
    /// is marked complete.
    pub async fn create_region_node(
        &self,
        path: &str,
        id: RegionId,
        bounding_box: &Hyperrectangle,
        state: RegionState,
    ) -> RegionResult<()> {
        self.store.create_node(path, Bytes::new()).await?;
        self.store
            .create_node(&region_id_path(path), Bytes::from(id.to_string()))
            .await?;
        self.store
            .create_node(&bbox_path(path), Bytes::from(bounding_box.to_string()))
            .await?;
        self.store
            .create_node(&state_path(path), Bytes::from(state.as_str()))
            .await?;
        self.store
            .create_node(&systems_path(path), Bytes::new())
            .await?;
        debug!(path, region_id = %id, bbox = %bounding_box, state = %state, "Created region node");
        Ok(())
    }

    /// Bump the mutation stamp of a region.
    pub async fn mark_mutation_complete(&self, path: &str) -> RegionResult<u64> {
        let stamp_path = mutation_path(path);
        let next = self.read_mutation_version(path).await?.map_or(1, |v| v + 1);
        self.store
            .set_data(&stamp_path, Bytes::from(next.to_string()))
            .await?;
        trace!(path, version = next, "Marked mutation complete");
        Ok(next)
    }

    pub async fn set_state(&self, path: &str, state: RegionState) -> RegionResult<()> {
        self.ensure_exists(path).await?;
        self.store
            .set_data(&state_path(path), Bytes::from(state.as_str()))
            .await?;
        self.mark_mutation_complete(path).await?;
        debug!(path, state = %state, "Set region state");
        Ok(())
    }

    /// Replace `expected` with `new`. Fails with `ConcurrentModification`
    /// when the stored state is different.
    pub async fn compare_and_set_state(
        &self,
        path: &str,
        expected: RegionState,
        new: RegionState,
    ) -> RegionResult<()> {
        let replaced = self
            .store
            .test_and_replace(
                &state_path(path),
                expected.as_str().as_bytes(),
                Bytes::from(new.as_str()),
            )
            .await?;

        if !replaced {
            return Err(RegionError::ConcurrentModification {
                path: path.to_string(),
                expected,
            });
        }

        self.mark_mutation_complete(path).await?;
        debug!(path, from = %expected, to = %new, "Swapped region state");
        Ok(())
    }

    pub async fn set_to_full(&self, path: &str) -> RegionResult<()> {
        self.compare_and_set_state(path, RegionState::Active, RegionState::ActiveFull)
            .await
    }

    pub async fn set_to_split_merging(&self, path: &str) -> RegionResult<()> {
        self.compare_and_set_state(path, RegionState::Split, RegionState::SplitMerging)
            .await
    }

    pub async fn add_system(&self, path: &str, node: &NodeId) -> RegionResult<()> {
        self.ensure_exists(path).await?;
        let system_path = format!("{}/{}", systems_path(path), node);
        match self.store.create_node(&system_path, Bytes::new()).await {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.mark_mutation_complete(path).await?;
        Ok(())
    }

    /// Replace the replica set of a region.
    pub async fn set_systems(&self, path: &str, nodes: &BTreeSet<NodeId>) -> RegionResult<()> {
        self.ensure_exists(path).await?;
        let base = systems_path(path);
        self.store.delete_recursive(&base).await?;
        self.store.create_node(&base, Bytes::new()).await?;
        for node in nodes {
            self.store
                .create_node(&format!("{base}/{node}"), Bytes::new())
                .await?;
        }
        self.mark_mutation_complete(path).await?;
        Ok(())
    }

    /// Delete a region subtree and stamp its parent so syncers unlink it.
    pub async fn delete_region(&self, path: &str) -> RegionResult<()> {
        self.store.delete_recursive(path).await?;
        if let Some(parent) = parent_path(path) {
            if self.is_complete(parent).await? {
                self.mark_mutation_complete(parent).await?;
            }
        }
        debug!(path, "Deleted region node");
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Record what `node` stores for the region, replacing its last report.
    pub async fn update_statistics(
        &self,
        path: &str,
        node: &NodeId,
        statistics: RegionStatistics,
    ) -> RegionResult<()> {
        validate_name("node", node.as_str())?;
        self.ensure_exists(path).await?;
        let base = format!("{}/{node}", statistics_path(path));
        self.store
            .set_data(
                &format!("{base}/{STATISTICS_TOTAL_SIZE_NODE}"),
                Bytes::from(statistics.total_size.to_string()),
            )
            .await?;
        self.store
            .set_data(
                &format!("{base}/{STATISTICS_TOTAL_TUPLES_NODE}"),
                Bytes::from(statistics.total_tuples.to_string()),
            )
            .await?;
        trace!(
            path,
            node = %node,
            size = statistics.total_size,
            tuples = statistics.total_tuples,
            "Updated region statistics"
        );
        Ok(())
    }

    /// Last report of every node. Reports without a readable size are skipped.
    pub async fn read_statistics(
        &self,
        path: &str,
    ) -> RegionResult<BTreeMap<NodeId, RegionStatistics>> {
        let base = statistics_path(path);
        let nodes = match self.store.get_children(&base).await {
            Ok(nodes) => nodes,
            Err(CoordinationError::NotFound(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reports = BTreeMap::new();
        for node in nodes {
            let node_path = format!("{base}/{node}");
            let size = self
                .read_counter(&format!("{node_path}/{STATISTICS_TOTAL_SIZE_NODE}"))
                .await;
            let tuples = self
                .read_counter(&format!("{node_path}/{STATISTICS_TOTAL_TUPLES_NODE}"))
                .await;
            match (size, tuples) {
                (Ok(Some(total_size)), Ok(total_tuples)) => {
                    let statistics = RegionStatistics::new(total_size, total_tuples.unwrap_or(0));
                    reports.insert(NodeId::new(node), statistics);
                }
                (Ok(None), _) => {}
                (Err(e), _) | (_, Err(e)) => match e {
                    RegionError::MalformedData { .. } => {
                        warn!(path = %node_path, error = %e, "Skipping unreadable region statistics");
                    }
                    e => return Err(e),
                },
            }
        }
        Ok(reports)
    }

    pub async fn delete_statistics(&self, path: &str) -> RegionResult<()> {
        self.store.delete_recursive(&statistics_path(path)).await?;
        debug!(path, "Deleted region statistics");
        Ok(())
    }

    async fn read_counter(&self, path: &str) -> RegionResult<Option<u64>> {
        match self.store.read_string(path).await {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RegionError::malformed(path, format!("bad counter '{raw}'"))),
            Err(CoordinationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes below a deleted region would resurrect parts of it.
    async fn ensure_exists(&self, path: &str) -> RegionResult<()> {
        if !self.store.exists(path).await? {
            return Err(CoordinationError::NotFound(path.to_string()).into());
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn exists(&self, path: &str) -> RegionResult<bool> {
        Ok(self.store.exists(path).await?)
    }

    /// A region is complete once its mutation stamp exists.
    pub async fn is_complete(&self, path: &str) -> RegionResult<bool> {
        Ok(self.store.exists(&mutation_path(path)).await?)
    }

    pub async fn read_mutation_version(&self, path: &str) -> RegionResult<Option<u64>> {
        let stamp_path = mutation_path(path);
        match self.store.read_string(&stamp_path).await {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RegionError::malformed(stamp_path, format!("bad stamp '{raw}'"))),
            Err(CoordinationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_region_id(&self, path: &str) -> RegionResult<RegionId> {
        let id_path = region_id_path(path);
        let raw = self.store.read_string(&id_path).await?;
        raw.parse()
            .map_err(|_| RegionError::malformed(id_path, format!("bad region id '{raw}'")))
    }

    pub async fn read_state(&self, path: &str) -> RegionResult<RegionState> {
        let path = state_path(path);
        let raw = self.store.read_string(&path).await?;
        raw.parse().map_err(|e: String| RegionError::malformed(path, e))
    }

    pub async fn read_bounding_box(&self, path: &str) -> RegionResult<Hyperrectangle> {
        let path = bbox_path(path);
        let raw = self.store.read_string(&path).await?;
        raw.parse()
            .map_err(|e: crate::hyperrectangle::GeometryError| {
                RegionError::malformed(path, e.to_string())
            })
    }

    pub async fn read_systems(&self, path: &str) -> RegionResult<BTreeSet<NodeId>> {
        match self.store.get_children(&systems_path(path)).await {
            Ok(names) => Ok(names.into_iter().map(NodeId::new).collect()),
            Err(CoordinationError::NotFound(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Child numbers present below a region, including incomplete children.
    pub async fn read_child_numbers(&self, path: &str) -> RegionResult<Vec<u32>> {
        let mut numbers: Vec<u32> = self
            .store
            .get_children(path)
            .await?
            .iter()
            .filter_map(|name| parse_child_number(name))
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Read a complete region node, `None` when it is absent or incomplete.
    pub async fn read_region(&self, path: &str) -> RegionResult<Option<StoredRegion>> {
        let result: RegionResult<Option<StoredRegion>> = async {
            let Some(mutation_version) = self.read_mutation_version(path).await? else {
                return Ok(None);
            };
            Ok(Some(StoredRegion {
                path: path.to_string(),
                id: self.read_region_id(path).await?,
                bounding_box: self.read_bounding_box(path).await?,
                state: self.read_state(path).await?,
                systems: self.read_systems(path).await?,
                mutation_version,
                child_numbers: self.read_child_numbers(path).await?,
            }))
        }
        .await;

        match result {
            // Deleted while we were reading it.
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }
}
