//! In-memory region tree.
//!
//! The tree is an arena: every [`Region`] lives in a flat table keyed by its
//! [`RegionId`] and refers to its parent and children by id. A tree is only
//! ever mutated by the [`RegionTreeSyncer`](super::RegionTreeSyncer) on a
//! private working copy; readers get immutable `Arc<RegionTree>` snapshots.
//!
//! # State machine
//!
//! ```text
//!  CREATING ──▶ ACTIVE ──▶ SPLITTING ──▶ SPLIT (kd-tree) / deleted (grid)
//!                │  ▲
//!                ▼  │ (compare-and-swap)
//!             ACTIVE_FULL
//!
//!  ACTIVE ──▶ MERGING (merge sources)
//!  REDISTRIBUTION_ACTIVE ──▶ ACTIVE (merge / split destinations)
//!  SPLIT ◀──▶ SPLIT_MERGING (compare-and-swap)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::hyperrectangle::Hyperrectangle;

use super::error::{RegionError, RegionResult};
use super::membership::NodeId;

/// Identifier of a region, unique and never reused within a distribution group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

impl RegionId {
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RegionId {
    fn from(value: u64) -> Self {
        RegionId(value)
    }
}

impl FromStr for RegionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(RegionId)
    }
}

/// Lifecycle state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// Node written, replicas not yet placed.
    Creating,
    Active,
    /// Active and over its size limit, waiting to be split.
    ActiveFull,
    Splitting,
    /// Inner node whose data lives in its children.
    Split,
    Merging,
    /// Destination of a merge or split while data is moved in.
    RedistributionActive,
    SplitMerging,
}

impl RegionState {
    pub const ALL: [RegionState; 8] = [
        RegionState::Creating,
        RegionState::Active,
        RegionState::ActiveFull,
        RegionState::Splitting,
        RegionState::Split,
        RegionState::Merging,
        RegionState::RedistributionActive,
        RegionState::SplitMerging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegionState::Creating => "creating",
            RegionState::Active => "active",
            RegionState::ActiveFull => "active-full",
            RegionState::Splitting => "splitting",
            RegionState::Split => "split",
            RegionState::Merging => "merging",
            RegionState::RedistributionActive => "redistribution-active",
            RegionState::SplitMerging => "split-merging",
        }
    }

    /// `ACTIVE` or `ACTIVE_FULL`: the region serves reads from local tables.
    pub fn is_active(&self) -> bool {
        matches!(self, RegionState::Active | RegionState::ActiveFull)
    }

    /// Inner node states of a split tree.
    pub fn is_inner(&self) -> bool {
        matches!(self, RegionState::Split | RegionState::SplitMerging)
    }

    /// States that only exist while a split or merge is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            RegionState::Creating
                | RegionState::Splitting
                | RegionState::Merging
                | RegionState::RedistributionActive
                | RegionState::SplitMerging
        )
    }

    /// Whether queries are routed to the region's systems.
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            RegionState::Active
                | RegionState::ActiveFull
                | RegionState::Splitting
                | RegionState::RedistributionActive
                | RegionState::Merging
        )
    }

    /// Whether new tuples are routed to the region's systems.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            RegionState::Active | RegionState::ActiveFull | RegionState::RedistributionActive
        )
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        RegionState::ALL
            .into_iter()
            .find(|state| state.as_str() == trimmed)
            .ok_or_else(|| format!("unknown region state '{trimmed}'"))
    }
}

/// A node of the region tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: RegionId,
    pub group: String,
    /// Position below the parent; the root uses 0.
    pub child_number: u32,
    pub parent: Option<RegionId>,
    pub children: BTreeMap<u32, RegionId>,
    pub bounding_box: Hyperrectangle,
    pub state: RegionState,
    pub systems: BTreeSet<NodeId>,
    /// Depth in the tree, root = 0.
    pub level: u32,
}

impl Region {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_hosted_by(&self, node: &NodeId) -> bool {
        self.systems.contains(node)
    }
}

/// Arena of regions for one distribution group.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTree {
    group: String,
    root: RegionId,
    regions: HashMap<RegionId, Region>,
}

impl RegionTree {
    pub(crate) fn with_root(root: Region) -> Self {
        let group = root.group.clone();
        let root_id = root.id;
        let mut regions = HashMap::new();
        regions.insert(root_id, root);
        Self {
            group,
            root: root_id,
            regions,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn root_id(&self) -> RegionId {
        self.root
    }

    pub fn root(&self) -> &Region {
        // The root is inserted at construction and never removed.
        &self.regions[&self.root]
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn region(&self, id: RegionId) -> RegionResult<&Region> {
        self.regions.get(&id).ok_or(RegionError::RegionNotFound(id))
    }

    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn parent(&self, id: RegionId) -> Option<&Region> {
        self.regions
            .get(&id)
            .and_then(|region| region.parent)
            .and_then(|parent| self.regions.get(&parent))
    }

    /// Children ordered by child number.
    pub fn children(&self, id: RegionId) -> Vec<&Region> {
        self.regions
            .get(&id)
            .map(|region| {
                region
                    .children
                    .values()
                    .filter_map(|child| self.regions.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn child(&self, id: RegionId, child_number: u32) -> Option<&Region> {
        self.regions
            .get(&id)
            .and_then(|region| region.children.get(&child_number))
            .and_then(|child| self.regions.get(child))
    }

    /// Highest child number in use below `id`, `None` for leaves.
    pub fn highest_child_number(&self, id: RegionId) -> Option<u32> {
        self.regions
            .get(&id)
            .and_then(|region| region.children.keys().next_back().copied())
    }

    /// All regions in pre-order, children visited by child number.
    pub fn iter(&self) -> Vec<&Region> {
        self.subtree(self.root)
    }

    /// `id` and all of its descendants in pre-order.
    pub fn subtree(&self, id: RegionId) -> Vec<&Region> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(region) = self.regions.get(&next) else {
                continue;
            };
            result.push(region);
            stack.extend(region.children.values().rev().copied());
        }
        result
    }

    pub fn leaves(&self) -> Vec<&Region> {
        self.iter()
            .into_iter()
            .filter(|region| region.is_leaf())
            .collect()
    }

    pub fn depth(&self) -> u32 {
        self.regions
            .values()
            .map(|region| region.level)
            .max()
            .unwrap_or(0)
    }

    pub fn regions_intersecting(&self, bbox: &Hyperrectangle) -> Vec<&Region> {
        self.iter()
            .into_iter()
            .filter(|region| region.bounding_box.intersects(bbox))
            .collect()
    }

    pub fn leaves_intersecting(&self, bbox: &Hyperrectangle) -> Vec<&Region> {
        self.regions_intersecting(bbox)
            .into_iter()
            .filter(|region| region.is_leaf())
            .collect()
    }

    /// Systems to contact for `bbox`, each with the regions it serves there.
    ///
    /// Only regions whose state passes `state_filter` are considered, e.g.
    /// [`RegionState::is_readable`] for queries and
    /// [`RegionState::accepts_writes`] for inserts.
    pub fn systems_for_box<F>(
        &self,
        bbox: &Hyperrectangle,
        state_filter: F,
    ) -> BTreeMap<NodeId, Vec<RegionId>>
    where
        F: Fn(&RegionState) -> bool,
    {
        let mut hops: BTreeMap<NodeId, Vec<RegionId>> = BTreeMap::new();
        for region in self.regions_intersecting(bbox) {
            if !state_filter(&region.state) {
                continue;
            }
            for system in &region.systems {
                hops.entry(system.clone()).or_default().push(region.id);
            }
        }
        hops
    }

    pub fn regions_hosted_by(&self, node: &NodeId) -> Vec<&Region> {
        self.iter()
            .into_iter()
            .filter(|region| region.is_hosted_by(node))
            .collect()
    }

    /// Number of regions each node hosts.
    pub fn node_usage(&self) -> HashMap<NodeId, u64> {
        let mut usage = HashMap::new();
        for region in self.regions.values() {
            for system in &region.systems {
                *usage.entry(system.clone()).or_insert(0) += 1;
            }
        }
        usage
    }

    /// Child numbers leading from the root to `id`.
    pub fn child_path(&self, id: RegionId) -> RegionResult<Vec<u32>> {
        let mut numbers = Vec::new();
        let mut current = self.region(id)?;
        while let Some(parent) = current.parent {
            numbers.push(current.child_number);
            current = self.region(parent)?;
        }
        numbers.reverse();
        Ok(numbers)
    }

    /// Follow `numbers` from the root.
    pub fn find_by_child_path(&self, numbers: &[u32]) -> Option<&Region> {
        let mut current = self.root();
        for number in numbers {
            current = self.child(current.id, *number)?;
        }
        Some(current)
    }

    /// Regions whose children do not exactly partition their own box.
    ///
    /// Children must be pairwise disjoint, their covering box must equal the
    /// parent's box and, for bounded boxes, their volumes must add up to the
    /// parent's volume.
    pub fn partition_violations(&self) -> Vec<RegionId> {
        let mut violations = Vec::new();
        for region in self.iter() {
            if region.is_leaf() {
                continue;
            }
            let children = self.children(region.id);

            let disjoint = children.iter().enumerate().all(|(i, a)| {
                children[i + 1..]
                    .iter()
                    .all(|b| !a.bounding_box.intersects(&b.bounding_box))
            });

            let covering =
                Hyperrectangle::covering_box(children.iter().map(|child| &child.bounding_box));
            let covers = covering == region.bounding_box;

            let parent_volume = region.bounding_box.volume();
            let volumes_match = if parent_volume.is_finite() {
                let sum: f64 = children.iter().map(|c| c.bounding_box.volume()).sum();
                (sum - parent_volume).abs() <= parent_volume.abs() * 1e-9
            } else {
                true
            };

            if !(disjoint && covers && volumes_match) {
                violations.push(region.id);
            }
        }
        violations
    }

    pub(crate) fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    /// Link `child` below its parent. The parent must already be in the tree.
    pub(crate) fn insert_child(&mut self, child: Region) -> RegionResult<()> {
        let parent_id = child
            .parent
            .ok_or_else(|| RegionError::configuration("child region without parent"))?;
        let parent = self
            .regions
            .get_mut(&parent_id)
            .ok_or(RegionError::RegionNotFound(parent_id))?;
        parent.children.insert(child.child_number, child.id);
        self.regions.insert(child.id, child);
        Ok(())
    }

    /// Unlink `id` and all descendants, returning them children-first.
    pub(crate) fn remove_subtree(&mut self, id: RegionId) -> Vec<Region> {
        if id == self.root {
            return Vec::new();
        }

        let ids: Vec<RegionId> = self.subtree(id).iter().map(|region| region.id).collect();

        if let Some(parent_id) = self.regions.get(&id).and_then(|region| region.parent) {
            if let Some(parent) = self.regions.get_mut(&parent_id) {
                parent.children.retain(|_, child| *child != id);
            }
        }

        // Reverse pre-order visits every child before its parent.
        ids.into_iter()
            .rev()
            .filter_map(|region_id| self.regions.remove(&region_id))
            .collect()
    }
}
