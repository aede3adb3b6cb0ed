//! Space partitioners.
//!
//! A [`SpacePartitioner`] owns the shape of one distribution group's region
//! tree: it creates the root, splits leaves and merges siblings. Every
//! structural change is written to the coordination store and then awaited on
//! the group's [`RegionTreeSyncer`], so a call returns only once the local
//! mirror reflects it.
//!
//! # Split protocol
//!
//! ```text
//!  source ACTIVE ──▶ SPLITTING ──split_complete──▶ SPLIT (kd-tree) / deleted (grid)
//!  children  CREATING ──▶ REDISTRIBUTION_ACTIVE ──split_complete──▶ ACTIVE
//!                 └──────────split_failed──────────▶ deleted, source ACTIVE
//! ```
//!
//! # Merge protocol
//!
//! ```text
//!  sources      ACTIVE ──prepare_merge──▶ MERGING ──merge_complete──▶ deleted
//!  destination  ──prepare_merge──▶ REDISTRIBUTION_ACTIVE ──merge_complete──▶ ACTIVE
//! ```
//!
//! Partitioners are resolved from the group configuration through
//! [`PartitionerKind`]; see [`build_partitioner`].

mod grid;
mod kdtree;
mod quadtree;

pub use grid::{GridLayout, GridPartitioner};
pub use kdtree::KdTreePartitioner;
pub use quadtree::QuadTreePartitioner;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::hyperrectangle::Hyperrectangle;

use super::config::{DistributionGroupConfig, PartitionerSettings};
use super::coordination::CoordinationStore;
use super::error::{RegionError, RegionResult};
use super::group::DistributionGroupAdapter;
use super::id_mapper::RegionIdMapper;
use super::membership::{ClusterMembership, NodeId};
use super::metrics;
use super::paths::{StorePaths, child_path};
use super::placement::{ResourceAllocator, with_tree_usage};
use super::region::{Region, RegionId, RegionState, RegionTree};
use super::region_store::RegionStore;
use super::split_point::SampleSource;
use super::statistics::{self, RegionStatistics, region_size};
use super::syncer::{CallbackId, RegionCallback, RegionTreeSyncer};

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionerKind {
    KdTree,
    FixedGrid,
    StaticGrid,
    DynamicGrid,
    QuadTree,
}

impl PartitionerKind {
    pub const ALL: [PartitionerKind; 5] = [
        PartitionerKind::KdTree,
        PartitionerKind::FixedGrid,
        PartitionerKind::StaticGrid,
        PartitionerKind::DynamicGrid,
        PartitionerKind::QuadTree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionerKind::KdTree => "kdtree",
            PartitionerKind::FixedGrid => "fixed-grid",
            PartitionerKind::StaticGrid => "static-grid",
            PartitionerKind::DynamicGrid => "dynamic-grid",
            PartitionerKind::QuadTree => "quadtree",
        }
    }
}

impl fmt::Display for PartitionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        PartitionerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown space partitioner '{normalized}', expected one of: kdtree, fixed-grid, static-grid, dynamic-grid, quadtree"
                )
            })
    }
}

/// Create the partitioner named by the context's group configuration.
pub fn build_partitioner(
    context: Arc<SpacePartitionerContext>,
) -> RegionResult<Arc<dyn SpacePartitioner>> {
    let kind = context.config().partitioner_kind()?;
    let partitioner: Arc<dyn SpacePartitioner> = match kind {
        PartitionerKind::KdTree => Arc::new(KdTreePartitioner::new(context)?),
        PartitionerKind::FixedGrid => Arc::new(GridPartitioner::new(context, GridLayout::Fixed)?),
        PartitionerKind::StaticGrid => Arc::new(GridPartitioner::new(context, GridLayout::Static)?),
        PartitionerKind::DynamicGrid => {
            Arc::new(GridPartitioner::new(context, GridLayout::Dynamic)?)
        }
        PartitionerKind::QuadTree => Arc::new(QuadTreePartitioner::new(context)),
    };
    Ok(partitioner)
}

pub(crate) fn unsupported(kind: PartitionerKind, operation: &'static str) -> RegionError {
    RegionError::Unsupported {
        partitioner: kind.as_str(),
        operation,
    }
}

// =============================================================================
// Partitioner contract
// =============================================================================

#[async_trait]
pub trait SpacePartitioner: Send + Sync {
    fn kind(&self) -> PartitionerKind;

    fn context(&self) -> &SpacePartitionerContext;

    /// Create the group's root region (and, for grids, the whole grid).
    async fn create_root_node(&self) -> RegionResult<Arc<RegionTree>>;

    /// Current tree, `None` when the group or its root does not exist.
    async fn root_node(&self) -> RegionResult<Option<Arc<RegionTree>>> {
        self.context().syncer().root_node().await
    }

    /// Split a leaf at a point chosen from `samples`. Returns the new regions.
    async fn split_region(
        &self,
        region: RegionId,
        samples: &dyn SampleSource,
    ) -> RegionResult<Vec<RegionId>>;

    /// Split a leaf at an explicit position of its split dimension.
    async fn split_region_at(&self, region: RegionId, position: f64)
    -> RegionResult<Vec<RegionId>>;

    async fn split_complete(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()>;

    async fn split_failed(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()>;

    /// Region that will hold the merged data of `sources`.
    async fn destination_for_merge(&self, sources: &[RegionId]) -> RegionResult<RegionId>;

    async fn prepare_merge(&self, sources: &[RegionId], destination: RegionId)
    -> RegionResult<()>;

    async fn merge_complete(
        &self,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()>;

    async fn merge_failed(&self, sources: &[RegionId], destination: RegionId)
    -> RegionResult<()>;

    fn is_splitable(&self, region: &Region) -> bool;

    fn is_merging_supported(&self, region: &Region) -> bool;

    /// Groups of regions that could be merged together with `region`.
    fn merge_candidates(&self, region: &Region) -> Vec<Vec<RegionId>>;

    /// `ACTIVE → ACTIVE_FULL`. A concurrent transition surfaces as a benign error.
    async fn set_region_full(&self, region: RegionId) -> RegionResult<()> {
        let context = self.context();
        let tree = context.tree().await?;
        let path = context.region_path(&tree, region)?;
        context.regions().set_to_full(&path).await
    }

    fn register_callback(&self, callback: RegionCallback) -> CallbackId {
        self.context()
            .syncer()
            .register_callback(move |event| callback(event))
    }

    fn unregister_callback(&self, id: CallbackId) -> bool {
        self.context().syncer().unregister_callback(id)
    }

    fn shutdown(&self) {
        self.context().syncer().shutdown();
    }
}

// =============================================================================
// Context
// =============================================================================

/// Where the regions created by a split are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitLayout {
    /// Below the source, which stays as an inner node.
    Below,
    /// Next to the source under its parent; the source is deleted afterwards.
    Beside,
}

/// Everything a partitioner needs for one distribution group.
pub struct SpacePartitionerContext {
    group: String,
    config: DistributionGroupConfig,
    settings: PartitionerSettings,
    paths: StorePaths,
    store: Arc<dyn CoordinationStore>,
    groups: DistributionGroupAdapter,
    regions: RegionStore,
    membership: ClusterMembership,
    allocator: ResourceAllocator,
    mapper: Arc<RegionIdMapper>,
    syncer: Arc<RegionTreeSyncer>,
}

impl fmt::Debug for SpacePartitionerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpacePartitionerContext")
            .field("group", &self.group)
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl SpacePartitionerContext {
    /// Validate the configuration and start the group's syncer.
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        settings: PartitionerSettings,
        group: impl Into<String>,
        config: DistributionGroupConfig,
    ) -> RegionResult<Self> {
        let group = group.into();
        config.check()?;
        settings
            .validate()
            .map_err(|errors| RegionError::Configuration(errors.join("; ")))?;

        let paths = StorePaths::new(settings.cluster_name.clone())?;
        let allocator = ResourceAllocator::for_kind(config.placement_kind()?, &config.placement_config);
        let mapper = Arc::new(RegionIdMapper::new(group.clone()));
        let syncer = RegionTreeSyncer::start(
            Arc::clone(&store),
            paths.clone(),
            group.clone(),
            settings.local_node.clone(),
            Arc::clone(&mapper),
        )
        .await?;

        debug!(group = %group, partitioner = %config.space_partitioner, "Opened partitioner context");
        Ok(Self {
            groups: DistributionGroupAdapter::new(Arc::clone(&store), paths.clone()),
            regions: RegionStore::new(Arc::clone(&store)),
            membership: ClusterMembership::new(Arc::clone(&store), paths.clone()),
            group,
            config,
            settings,
            paths,
            store,
            allocator,
            mapper,
            syncer,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn config(&self) -> &DistributionGroupConfig {
        &self.config
    }

    pub fn settings(&self) -> &PartitionerSettings {
        &self.settings
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn groups(&self) -> &DistributionGroupAdapter {
        &self.groups
    }

    pub fn regions(&self) -> &RegionStore {
        &self.regions
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn mapper(&self) -> &Arc<RegionIdMapper> {
        &self.mapper
    }

    pub fn syncer(&self) -> &Arc<RegionTreeSyncer> {
        &self.syncer
    }

    /// Current tree; a missing group is an error here.
    pub async fn tree(&self) -> RegionResult<Arc<RegionTree>> {
        self.syncer
            .root_node()
            .await?
            .ok_or_else(|| RegionError::GroupNotFound(self.group.clone()))
    }

    pub fn region_path(&self, tree: &RegionTree, id: RegionId) -> RegionResult<String> {
        self.paths.region_path(tree, id)
    }

    // =========================================================================
    // Building blocks
    // =========================================================================

    /// Allocate an id and write a complete region node at `path`.
    pub async fn create_region(
        &self,
        path: &str,
        bounding_box: &Hyperrectangle,
        state: RegionState,
    ) -> RegionResult<RegionId> {
        let id = self.groups.next_region_id(&self.group).await?;
        let written = async {
            self.regions
                .create_region_node(path, id, bounding_box, state)
                .await?;
            self.regions.mark_mutation_complete(path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = self.store.delete_recursive(path).await {
                warn!(path, error = %cleanup, "Failed to remove partially written region");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Pick replicas for a new region, balancing on the regions each node
    /// already hosts in `tree`.
    pub async fn allocate_systems(
        &self,
        tree: Option<&RegionTree>,
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<BTreeSet<NodeId>> {
        let mut nodes = self.membership.nodes().await?;
        if let Some(tree) = tree {
            nodes = with_tree_usage(nodes, tree);
        }
        let picked = self.allocator.allocate(
            self.config.replication_factor as usize,
            &nodes,
            blacklist,
        )?;
        Ok(picked.into_iter().map(|instance| instance.id).collect())
    }

    /// Allocate replicas and write them to the region at `path`.
    pub async fn allocate_into(
        &self,
        path: &str,
        tree: Option<&RegionTree>,
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<BTreeSet<NodeId>> {
        let systems = self.allocate_systems(tree, blacklist).await?;
        self.regions.set_systems(path, &systems).await?;
        Ok(systems)
    }

    // =========================================================================
    // Size statistics
    // =========================================================================

    /// Record the size of `region` on `node`.
    pub async fn update_region_statistics(
        &self,
        region: RegionId,
        node: &NodeId,
        statistics: RegionStatistics,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        let path = self.region_path(&tree, region)?;
        self.regions.update_statistics(&path, node, statistics).await
    }

    pub async fn region_statistics(
        &self,
        region: RegionId,
    ) -> RegionResult<BTreeMap<NodeId, RegionStatistics>> {
        let tree = self.tree().await?;
        let path = self.region_path(&tree, region)?;
        self.regions.read_statistics(&path).await
    }

    pub async fn delete_region_statistics(&self, region: RegionId) -> RegionResult<()> {
        let tree = self.tree().await?;
        let path = self.region_path(&tree, region)?;
        self.regions.delete_statistics(&path).await
    }

    /// Whether leaf `region` outgrew the group's `max_region_size`.
    pub async fn is_region_overflow(&self, region: RegionId) -> RegionResult<bool> {
        let tree = self.tree().await?;
        let path = self.region_path(&tree, region)?;
        let size = region_size(&self.regions.read_statistics(&path).await?);
        statistics::is_overflow(&tree, region, size, self.config.max_region_size)
    }

    /// Whether the children of `region` together fell below the group's
    /// `min_region_size`. Only a host of `region` answers `true` when this
    /// process has a local node.
    pub async fn is_region_underflow(&self, region: RegionId) -> RegionResult<bool> {
        let tree = self.tree().await?;
        let mut sizes = BTreeMap::new();
        for child in tree.children(region) {
            let path = self.region_path(&tree, child.id)?;
            if let Some(size) = region_size(&self.regions.read_statistics(&path).await?) {
                sizes.insert(child.id, size);
            }
        }
        statistics::is_underflow(
            &tree,
            region,
            &sizes,
            self.config.min_region_size,
            self.settings.local_node.as_ref(),
        )
    }

    /// Block until the syncer publishes a tree satisfying `predicate`.
    pub async fn wait_until<P>(&self, what: impl Into<String>, predicate: P) -> RegionResult<Arc<RegionTree>>
    where
        P: FnMut(&RegionTree) -> bool,
    {
        self.syncer
            .wait_for(what, self.settings.structure_wait_timeout, predicate)
            .await
    }

    async fn set_state_of(&self, tree: &RegionTree, id: RegionId, state: RegionState) -> RegionResult<()> {
        let path = self.region_path(tree, id)?;
        self.regions.set_state(&path, state).await
    }

    /// Delete the children of `parent_path` whose id is in `ids`.
    async fn delete_children_by_id(&self, parent_path: &str, ids: &[RegionId]) -> RegionResult<()> {
        let numbers = match self.regions.read_child_numbers(parent_path).await {
            Ok(numbers) => numbers,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        for number in numbers {
            let path = child_path(parent_path, number);
            match self.regions.read_region_id(&path).await {
                Ok(id) if ids.contains(&id) => self.regions.delete_region(&path).await?,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn split_parent_path(
        &self,
        tree: &RegionTree,
        source: &Region,
        layout: SplitLayout,
    ) -> RegionResult<String> {
        match layout {
            SplitLayout::Below => self.region_path(tree, source.id),
            SplitLayout::Beside => {
                let parent = source.parent.ok_or_else(|| RegionError::InvalidState {
                    region: source.id,
                    actual: source.state,
                    expected: "a region with a parent".to_string(),
                })?;
                self.region_path(tree, parent)
            }
        }
    }

    // =========================================================================
    // Split machinery
    // =========================================================================

    /// Split leaf `source` at `position` of `dimension` into two new regions.
    ///
    /// The low half keeps the source's replicas; the high half gets fresh
    /// replicas, blacklisting the source's own systems. Any failure after the
    /// children were written rolls the split back before the error surfaces.
    pub(crate) async fn split_node(
        &self,
        kind: PartitionerKind,
        source: RegionId,
        dimension: usize,
        position: f64,
        layout: SplitLayout,
    ) -> RegionResult<Vec<RegionId>> {
        let tree = self.tree().await?;
        let region = tree.region(source)?.clone();
        if !(region.is_leaf() && region.state == RegionState::Active) {
            return Err(RegionError::InvalidState {
                region: source,
                actual: region.state,
                expected: "an active leaf".to_string(),
            });
        }

        let (low, high) = region.bounding_box.split_at(dimension, position)?;
        let source_path = self.region_path(&tree, source)?;
        let parent_path = self.split_parent_path(&tree, &region, layout)?;
        let first = self
            .regions
            .read_child_numbers(&parent_path)
            .await?
            .last()
            .map_or(0, |highest| highest + 1);
        let low_path = child_path(&parent_path, first);
        let high_path = child_path(&parent_path, first + 1);

        info!(
            group = %self.group,
            partitioner = %kind,
            region_id = %source,
            dimension,
            position,
            "Splitting region"
        );

        let low_id = self
            .create_region(&low_path, &low, RegionState::Creating)
            .await?;
        let high_id = match self
            .create_region(&high_path, &high, RegionState::Creating)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.abort_split(&source_path, &[low_path.as_str()]).await;
                metrics::record_split(kind.as_str(), "failed");
                return Err(e);
            }
        };
        let children = vec![low_id, high_id];

        let result = self
            .populate_split_children(&tree, &region, &source_path, [(low_id, &low_path), (high_id, &high_path)])
            .await;

        match result {
            Ok(()) => {
                metrics::record_split(kind.as_str(), "started");
                Ok(children)
            }
            Err(e) => {
                warn!(
                    group = %self.group,
                    region_id = %source,
                    error = %e,
                    "Split failed, rolling back"
                );
                self.abort_split(&source_path, &[low_path.as_str(), high_path.as_str()])
                    .await;
                metrics::record_split(kind.as_str(), "failed");
                Err(e)
            }
        }
    }

    async fn populate_split_children(
        &self,
        tree: &RegionTree,
        source: &Region,
        source_path: &str,
        children: [(RegionId, &String); 2],
    ) -> RegionResult<()> {
        let [(low_id, low_path), (high_id, high_path)] = children;

        self.regions
            .set_state(source_path, RegionState::Splitting)
            .await?;
        self.wait_until(format!("children of region {}", source.id), |tree| {
            tree.get(source.id)
                .is_some_and(|r| r.state == RegionState::Splitting)
                && tree.contains(low_id)
                && tree.contains(high_id)
        })
        .await?;

        let target = if self.settings.redistribute_on_split {
            RegionState::RedistributionActive
        } else {
            RegionState::Active
        };

        self.regions.set_systems(low_path, &source.systems).await?;
        self.regions.set_state(low_path, target).await?;

        let high_state = match self.allocate_into(high_path, Some(tree), &source.systems).await {
            Ok(_) => {
                self.regions.set_state(high_path, target).await?;
                target
            }
            Err(e) if e.is_resource_allocation() && self.settings.ignore_allocation_failures => {
                warn!(
                    group = %self.group,
                    region_id = %high_id,
                    error = %e,
                    "No replicas for split child, leaving it in creating state"
                );
                RegionState::Creating
            }
            Err(e) => return Err(e),
        };

        self.wait_until(format!("split children of region {}", source.id), |tree| {
            tree.get(low_id).is_some_and(|r| r.state == target)
                && tree.get(high_id).is_some_and(|r| r.state == high_state)
        })
        .await?;
        Ok(())
    }

    /// Best-effort rollback of a split that failed while in progress.
    async fn abort_split(&self, source_path: &str, child_paths: &[&str]) {
        for path in child_paths {
            if let Err(e) = self.regions.delete_region(path).await {
                warn!(path, error = %e, "Failed to delete split child during rollback");
            }
        }
        if let Err(e) = self.regions.set_state(source_path, RegionState::Active).await {
            warn!(path = source_path, error = %e, "Failed to reset split source during rollback");
        }
    }

    pub(crate) async fn complete_split(
        &self,
        kind: PartitionerKind,
        source: RegionId,
        children: &[RegionId],
        layout: SplitLayout,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        let region = tree.region(source)?;
        if region.state != RegionState::Splitting {
            return Err(RegionError::InvalidState {
                region: source,
                actual: region.state,
                expected: RegionState::Splitting.to_string(),
            });
        }

        // A child without its replicas stays CREATING until retried or failed.
        let replicas = self.config.replication_factor as usize;
        for child in children {
            let child_region = tree.region(*child)?;
            if child_region.state == RegionState::Creating || child_region.systems.len() < replicas {
                return Err(RegionError::InvalidState {
                    region: *child,
                    actual: child_region.state,
                    expected: format!("a split child with {replicas} systems"),
                });
            }
        }

        for child in children {
            self.set_state_of(&tree, *child, RegionState::Active).await?;
        }

        let source_path = self.region_path(&tree, source)?;
        match layout {
            SplitLayout::Below => {
                self.regions
                    .set_state(&source_path, RegionState::Split)
                    .await?
            }
            SplitLayout::Beside => self.regions.delete_region(&source_path).await?,
        }

        self.wait_until(format!("split of region {source} to complete"), |tree| {
            let source_done = match layout {
                SplitLayout::Below => tree
                    .get(source)
                    .is_some_and(|r| r.state == RegionState::Split),
                SplitLayout::Beside => !tree.contains(source),
            };
            source_done
                && children
                    .iter()
                    .all(|child| tree.get(*child).is_some_and(|r| r.state == RegionState::Active))
        })
        .await?;

        metrics::record_split(kind.as_str(), "complete");
        info!(group = %self.group, partitioner = %kind, region_id = %source, "Split complete");
        Ok(())
    }

    pub(crate) async fn fail_split(
        &self,
        kind: PartitionerKind,
        source: RegionId,
        children: &[RegionId],
        layout: SplitLayout,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        let region = tree.region(source)?;
        let parent_path = self.split_parent_path(&tree, region, layout)?;
        let source_path = self.region_path(&tree, source)?;

        self.delete_children_by_id(&parent_path, children).await?;
        self.regions
            .set_state(&source_path, RegionState::Active)
            .await?;

        self.wait_until(format!("split of region {source} to roll back"), |tree| {
            tree.get(source)
                .is_some_and(|r| r.state == RegionState::Active)
                && children.iter().all(|child| !tree.contains(*child))
        })
        .await?;

        metrics::record_split(kind.as_str(), "failed");
        info!(group = %self.group, partitioner = %kind, region_id = %source, "Split rolled back");
        Ok(())
    }

    // =========================================================================
    // Merge machinery
    // =========================================================================

    pub(crate) async fn prepare_merge_states(
        &self,
        kind: PartitionerKind,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        for source in sources {
            let region = tree.region(*source)?;
            if !region.state.is_active() {
                return Err(RegionError::InvalidState {
                    region: *source,
                    actual: region.state,
                    expected: "active".to_string(),
                });
            }
        }

        for source in sources {
            self.set_state_of(&tree, *source, RegionState::Merging)
                .await?;
        }
        self.set_state_of(&tree, destination, RegionState::RedistributionActive)
            .await?;

        self.wait_until(format!("merge into region {destination} to start"), |tree| {
            tree.get(destination)
                .is_some_and(|r| r.state == RegionState::RedistributionActive)
                && sources
                    .iter()
                    .all(|s| tree.get(*s).is_some_and(|r| r.state == RegionState::Merging))
        })
        .await?;

        metrics::record_merge(kind.as_str(), "prepared");
        info!(group = %self.group, partitioner = %kind, destination = %destination, "Merge prepared");
        Ok(())
    }

    pub(crate) async fn complete_merge(
        &self,
        kind: PartitionerKind,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        let destination_path = self.region_path(&tree, destination)?;
        for source in sources {
            let path = self.region_path(&tree, *source)?;
            self.regions.delete_region(&path).await?;
        }
        // Reports from before the split no longer describe the merged data.
        self.regions.delete_statistics(&destination_path).await?;
        self.regions
            .set_state(&destination_path, RegionState::Active)
            .await?;

        self.wait_until(format!("merge into region {destination} to complete"), |tree| {
            tree.get(destination)
                .is_some_and(|r| r.state == RegionState::Active)
                && sources.iter().all(|s| !tree.contains(*s))
        })
        .await?;

        metrics::record_merge(kind.as_str(), "complete");
        info!(group = %self.group, partitioner = %kind, destination = %destination, "Merge complete");
        Ok(())
    }

    /// Reset the merge sources to `ACTIVE` and the destination to `reset_to`,
    /// or delete the destination when `reset_to` is `None`.
    pub(crate) async fn fail_merge(
        &self,
        kind: PartitionerKind,
        sources: &[RegionId],
        destination: RegionId,
        reset_to: Option<RegionState>,
    ) -> RegionResult<()> {
        let tree = self.tree().await?;
        let destination_path = self.region_path(&tree, destination)?;
        match reset_to {
            Some(state) => self.regions.set_state(&destination_path, state).await?,
            None => self.regions.delete_region(&destination_path).await?,
        }
        for source in sources {
            self.set_state_of(&tree, *source, RegionState::Active)
                .await?;
        }

        self.wait_until(format!("merge into region {destination} to roll back"), |tree| {
            let destination_done = match reset_to {
                Some(state) => tree.get(destination).is_some_and(|r| r.state == state),
                None => !tree.contains(destination),
            };
            destination_done
                && sources
                    .iter()
                    .all(|s| tree.get(*s).is_some_and(|r| r.state == RegionState::Active))
        })
        .await?;

        metrics::record_merge(kind.as_str(), "failed");
        info!(group = %self.group, partitioner = %kind, destination = %destination, "Merge rolled back");
        Ok(())
    }

    // =========================================================================
    // Root creation
    // =========================================================================

    /// Fail with `GroupExists` when the group already has a root region.
    pub(crate) async fn ensure_no_root(&self) -> RegionResult<String> {
        let root_path = self.paths.root_region_path(&self.group);
        if self.regions.exists(&root_path).await? {
            return Err(RegionError::GroupExists(self.group.clone()));
        }
        Ok(root_path)
    }

    /// Create a single root leaf covering `bounding_box` and place its replicas.
    ///
    /// When placement fails the root stays `CREATING`.
    pub(crate) async fn create_leaf_root(
        &self,
        bounding_box: &Hyperrectangle,
    ) -> RegionResult<Arc<RegionTree>> {
        let root_path = self.ensure_no_root().await?;
        let root = self
            .create_region(&root_path, bounding_box, RegionState::Creating)
            .await?;

        let state = match self.allocate_into(&root_path, None, &BTreeSet::new()).await {
            Ok(_) => {
                self.regions
                    .set_state(&root_path, RegionState::Active)
                    .await?;
                RegionState::Active
            }
            Err(e) if e.is_resource_allocation() => {
                warn!(group = %self.group, error = %e, "No replicas for root region");
                RegionState::Creating
            }
            Err(e) => return Err(e),
        };

        self.wait_until(format!("root region {root}"), |tree| {
            tree.root_id() == root && tree.root().state == state
        })
        .await
    }
}

/// Ids of `region`'s siblings (itself included) when they are all active
/// leaves, ordered along dimension 0.
pub(crate) fn mergeable_siblings(tree: &RegionTree, region: &Region) -> Option<Vec<RegionId>> {
    let parent = region.parent?;
    let mut siblings = tree.children(parent);
    if siblings.len() < 2
        || !siblings
            .iter()
            .all(|sibling| sibling.is_leaf() && sibling.state.is_active())
    {
        return None;
    }
    siblings.sort_by(|a, b| a.bounding_box.cmp_by_low(&b.bounding_box));
    Some(siblings.into_iter().map(|sibling| sibling.id).collect())
}
