//! Region size statistics.
//!
//! Every replica of a region reports how many bytes and tuples it stores for
//! that region. A region's size is the largest report of any replica. The
//! group's `max_region_size` and `min_region_size` turn those sizes into
//! split and merge decisions:
//!
//! - **overflow**: a leaf larger than `max_region_size` should be split, but
//!   only once its parent finished handing over its data.
//! - **underflow**: an inner region whose children together hold less than
//!   `min_region_size` should have them merged back.
//!
//! The predicates here work on a tree snapshot and sizes already read from the
//! store; [`SpacePartitionerContext`](super::SpacePartitionerContext) wires
//! them to the store.

use std::collections::BTreeMap;

use tracing::debug;

use super::error::RegionResult;
use super::membership::NodeId;
use super::region::{RegionId, RegionState, RegionTree};

/// What one node reported for one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStatistics {
    /// Bytes.
    pub total_size: u64,
    pub total_tuples: u64,
}

impl RegionStatistics {
    pub fn new(total_size: u64, total_tuples: u64) -> Self {
        Self {
            total_size,
            total_tuples,
        }
    }
}

/// Largest reported size, `None` when no replica reported yet.
pub fn region_size(reports: &BTreeMap<NodeId, RegionStatistics>) -> Option<u64> {
    reports.values().map(|report| report.total_size).max()
}

/// Whether `region` holds more than `max_size` bytes and may be split.
pub fn is_overflow(
    tree: &RegionTree,
    region: RegionId,
    size: Option<u64>,
    max_size: u64,
) -> RegionResult<bool> {
    let region = tree.region(region)?;
    if !region.is_leaf() {
        return Ok(false);
    }
    // Data of a splitting parent is still moving into this region.
    if let Some(parent) = region.parent {
        if tree.region(parent)?.state != RegionState::Split {
            return Ok(false);
        }
    }
    Ok(size.unwrap_or(0) > max_size)
}

/// Whether the children of `region` together hold less than `min_size` bytes.
///
/// `child_sizes` maps each child to its size; a child missing from it has no
/// reports yet and makes the answer `false`. With `local` set, only a node
/// hosting `region` decides.
pub fn is_underflow(
    tree: &RegionTree,
    region: RegionId,
    child_sizes: &BTreeMap<RegionId, u64>,
    min_size: u64,
    local: Option<&NodeId>,
) -> RegionResult<bool> {
    let parent = tree.region(region)?;
    let children = tree.children(region);
    if children.is_empty() {
        return Ok(false);
    }
    if children.iter().any(|child| child.state != RegionState::Active) {
        debug!(region_id = %region, "Not all children active, skipping underflow check");
        return Ok(false);
    }
    if local.is_some_and(|node| !parent.is_hosted_by(node)) {
        return Ok(false);
    }

    let mut total = 0u64;
    for child in children {
        let Some(size) = child_sizes.get(&child.id) else {
            debug!(region_id = %region, child = %child.id, "No statistics for child");
            return Ok(false);
        };
        total = total.saturating_add(*size);
    }
    Ok(total < min_size)
}
