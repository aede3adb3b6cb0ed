//! # regiontree
//! Distributed region-tree management for multi-dimensional keyspaces.
//!
//! A distribution group partitions an n-dimensional space into
//! hyperrectangular regions, each replicated on a set of storage nodes. The
//! region tree is kept in a hierarchical coordination store and mirrored by
//! every process; this crate creates, splits and merges regions, places their
//! replicas and maps the regions hosted locally to table names.
//!
//! # Goals
//! - Easy to understand code
//! - Every structural change is observable: callers block until the local
//!   mirror reflects what they wrote
//! - Pluggable coordination store, placement strategy and split point selection
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use regiontree::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
//!     let settings = PartitionerSettings::from_env()?;
//!     let cache = SpacePartitionerCache::new(store, settings)?;
//!
//!     let config = DistributionGroupConfig::builder(2)
//!         .replication_factor(1)
//!         .space_partitioner("static-grid", "[[0.0,5.0]:[0.0,5.0]];0.5;0.5")
//!         .build();
//!     let partitioner = cache.create_group("points", &config).await?;
//!     let tree = partitioner.context().tree().await?;
//!     println!("{} regions", tree.len());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod distribution;
pub mod hyperrectangle;
pub mod telemetry;

pub mod prelude {
    //! Main exports for working with distribution groups.
    pub use crate::distribution::{
        ClusterMembership, CoordinationStore, DistributionGroupConfig, InMemoryCoordinationStore,
        NodeId, NodeState, PartitionerKind, PartitionerSettings, Region, RegionError, RegionEvent,
        RegionEventKind, RegionId, RegionIdMapper, RegionResult, RegionState, RegionTree,
        RegionTreeSyncer, SampleSource, SpacePartitioner, SpacePartitionerCache, StaticSamples,
        StorePaths, TableName,
    };
    pub use crate::hyperrectangle::{DoubleInterval, Hyperrectangle};
}
