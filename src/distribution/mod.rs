//! Region-tree management for distribution groups.
//!
//! A distribution group splits an n-dimensional keyspace into regions. Each
//! region is a hyperrectangle owned by a set of storage nodes; together the
//! leaves of a group's region tree partition its space. The authoritative
//! tree lives in a hierarchical coordination store, every process mirrors it
//! locally.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────────────────┐
//!              │ SpacePartitionerCache  │  one partitioner per group
//!              └───────────┬────────────┘
//!                          ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ SpacePartitioner (kd-tree / grids / quad)    │
//!   │   split, merge, root creation                │
//!   └──────┬──────────────────┬────────────────┬───┘
//!          │ writes           │ waits          │ placement
//!          ▼                  │                ▼
//!   ┌─────────────┐           │        ┌──────────────────┐
//!   │ RegionStore │           │        │ResourceAllocator │
//!   └──────┬──────┘           │        └──────────────────┘
//!          ▼                  │
//!   ┌──────────────────────┐  │
//!   │ CoordinationStore    │  │
//!   └──────┬───────────────┘  │
//!          │ watch events     │
//!          ▼                  │
//!   ┌──────────────────────┐  │    ┌────────────────┐
//!   │ RegionTreeSyncer     │──┴───▶│ RegionIdMapper │ local regions
//!   │  mirror + callbacks  │       └────────────────┘
//!   └──────────────────────┘
//! ```
//!
//! # Store layout
//!
//! ```text
//! /<cluster>/nodes/<node>                      node state
//! /<cluster>/groups/<group>/config             JSON group configuration
//! /<cluster>/groups/<group>/version            version marker
//! /<cluster>/groups/<group>/ids/id-<seq>       region id queue
//! /<cluster>/groups/<group>/root               root region
//!     region-id, bbox, state, systems/<node>, mutation, child-<n>/...
//!     statistics/<node>/{total-size,total-tuples}   size reports
//! ```
//!
//! A region element is complete once its `mutation` stamp exists; the syncer
//! ignores incomplete elements.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use regiontree::distribution::{
//!     ClusterMembership, CoordinationStore, DistributionGroupConfig, InMemoryCoordinationStore,
//!     NodeId, NodeState, PartitionerSettings, SpacePartitionerCache, StaticSamples, StorePaths,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
//!     let settings = PartitionerSettings::default();
//!     let membership = ClusterMembership::new(
//!         Arc::clone(&store),
//!         StorePaths::new(settings.cluster_name.clone())?,
//!     );
//!     membership.register_node(&NodeId::new("node-1"), NodeState::Ready).await?;
//!
//!     let cache = SpacePartitionerCache::new(store, settings)?;
//!     let config = DistributionGroupConfig::builder(2).replication_factor(1).build();
//!     let partitioner = cache.create_group("points", &config).await?;
//!
//!     let tree = partitioner.context().tree().await?;
//!     let children = partitioner
//!         .split_region(tree.root_id(), &StaticSamples::default())
//!         .await?;
//!     partitioner.split_complete(tree.root_id(), &children).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordination;
mod error;
mod group;
mod id_mapper;
mod membership;
pub mod metrics;
pub mod partitioner;
mod partitioner_cache;
pub mod paths;
mod placement;
mod region;
mod region_store;
pub mod retry;
mod split_point;
mod statistics;
mod syncer;

pub use config::{
    DistributionGroupConfig, DistributionGroupConfigBuilder, GridConfig, PartitionerSettings,
    SettingsProfile,
};
pub use coordination::{
    CoordinationStore, InMemoryCoordinationStore, WatchEvent, WatchEventKind, WatchSubscription,
};
pub use error::{CoordinationError, CoordinationResult, RegionError, RegionResult};
pub use group::{DistributionGroupAdapter, validate_group_name};
pub use id_mapper::{RegionIdMapper, TableName};
pub use membership::{ClusterMembership, NodeId, NodeInstance, NodeState};
pub use partitioner::{
    GridLayout, GridPartitioner, KdTreePartitioner, PartitionerKind, QuadTreePartitioner,
    SpacePartitioner, SpacePartitionerContext, build_partitioner,
};
pub use partitioner_cache::SpacePartitionerCache;
pub use paths::StorePaths;
pub use placement::{
    FixedPlacement, LowestUtilizationPlacement, PlacementStrategy, PlacementStrategyKind,
    RandomPlacement, ResourceAllocator, with_tree_usage,
};
pub use region::{Region, RegionId, RegionState, RegionTree};
pub use region_store::{RegionStore, StoredRegion};
pub use split_point::{
    SampleSource, SamplingBasedSplitStrategy, SimpleSplitStrategy, SplitPointStrategy,
    StaticSamples, strategy_for_samples,
};
pub use statistics::{RegionStatistics, is_overflow, is_underflow, region_size};
pub use syncer::{CallbackId, RegionCallback, RegionEvent, RegionEventKind, RegionTreeSyncer};
