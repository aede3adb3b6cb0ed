//! Centralized constants for the region-tree subsystem.
//!
//! # Categories
//!
//! - **Store Layout**: names of the nodes that make up a group and a region
//! - **Timeouts**: default bounds for every blocking wait
//! - **Defaults**: distribution group configuration defaults

use std::time::Duration;

// =============================================================================
// Store Layout
// =============================================================================

/// Root element of a distribution group's region tree.
pub const ROOT_NODE: &str = "root";

/// JSON-encoded distribution group configuration.
pub const GROUP_CONFIG_NODE: &str = "config";

/// Version marker, rewritten on every group (re)creation.
pub const GROUP_VERSION_NODE: &str = "version";

/// Parent of the sequential region id queue.
pub const GROUP_IDS_NODE: &str = "ids";

/// Prefix of the sequential nodes in the region id queue.
pub const REGION_ID_PREFIX: &str = "id-";

/// Prefix of a child region element; followed by the child number.
pub const CHILD_PREFIX: &str = "child-";

pub const REGION_ID_NODE: &str = "region-id";
pub const REGION_BBOX_NODE: &str = "bbox";
pub const REGION_STATE_NODE: &str = "state";
pub const REGION_SYSTEMS_NODE: &str = "systems";

/// Monotone mutation-complete stamp. A region node is complete once it exists.
pub const REGION_MUTATION_NODE: &str = "mutation";

/// Parent of the per-node size reports of a region. Not part of the mutation stamp.
pub const REGION_STATISTICS_NODE: &str = "statistics";
pub const STATISTICS_TOTAL_SIZE_NODE: &str = "total-size";
pub const STATISTICS_TOTAL_TUPLES_NODE: &str = "total-tuples";

/// Default cluster namespace below the store root.
pub const DEFAULT_CLUSTER_NAME: &str = "regiontree";

// =============================================================================
// Timeouts
// =============================================================================

/// Default bound for waiting on the syncer to observe structural changes.
pub const DEFAULT_STRUCTURE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for `wait_until_mapping_appears` / `_disappears`.
pub const DEFAULT_MAPPING_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the broadcast channel carrying region events.
pub const REGION_EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_DIMENSIONS: u32 = 2;
pub const DEFAULT_REPLICATION_FACTOR: u16 = 3;

/// 1 MiB
pub const DEFAULT_MIN_REGION_SIZE: u64 = 1024 * 1024;

/// 64 MiB
pub const DEFAULT_MAX_REGION_SIZE: u64 = 64 * 1024 * 1024;

pub const DEFAULT_PLACEMENT_STRATEGY: &str = "lowest-utilization";
pub const DEFAULT_SPACE_PARTITIONER: &str = "kdtree";

// =============================================================================
// Limits
// =============================================================================

/// Upper bound on the number of cells a grid configuration may produce.
pub const MAX_GRID_CELLS: usize = 1_000_000;
