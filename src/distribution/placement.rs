//! Replica placement.
//!
//! A [`ResourceAllocator`] picks `replication` distinct nodes for a new
//! region by asking a [`PlacementStrategy`] for one node at a time and
//! blacklisting every node it has already picked. The strategy is resolved
//! from the group configuration through [`PlacementStrategyKind`].
//!
//! Allocation is all-or-nothing: the eligible node count is checked before
//! the first pick, and the allocator itself never writes to the store, so a
//! failed allocation leaves nothing behind.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use super::error::{RegionError, RegionResult};
use super::membership::{NodeId, NodeInstance};
use super::metrics;
use super::region::RegionTree;

/// Picks a single node out of the available instances.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Select one ready instance that is not blacklisted.
    fn select_instance(
        &self,
        available: &[NodeInstance],
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<NodeInstance>;
}

fn eligible<'a>(
    available: &'a [NodeInstance],
    blacklist: &'a BTreeSet<NodeId>,
) -> impl Iterator<Item = &'a NodeInstance> + 'a {
    available
        .iter()
        .filter(move |instance| instance.is_ready() && !blacklist.contains(&instance.id))
}

fn no_eligible_instance(available: &[NodeInstance], blacklist: &BTreeSet<NodeId>) -> RegionError {
    RegionError::ResourceAllocation {
        required: 1,
        available: 0,
        reason: format!(
            "none of {} known nodes is ready and not blacklisted ({} blacklisted)",
            available.len(),
            blacklist.len()
        ),
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Uniformly random choice among eligible nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl PlacementStrategy for RandomPlacement {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select_instance(
        &self,
        available: &[NodeInstance],
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<NodeInstance> {
        let candidates: Vec<&NodeInstance> = eligible(available, blacklist).collect();
        if candidates.is_empty() {
            return Err(no_eligible_instance(available, blacklist));
        }
        Ok(candidates[fastrand::usize(..candidates.len())].clone())
    }
}

/// The eligible node hosting the fewest regions; ties go to the smallest id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestUtilizationPlacement;

impl PlacementStrategy for LowestUtilizationPlacement {
    fn name(&self) -> &'static str {
        "lowest-utilization"
    }

    fn select_instance(
        &self,
        available: &[NodeInstance],
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<NodeInstance> {
        eligible(available, blacklist)
            .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
            .cloned()
            .ok_or_else(|| no_eligible_instance(available, blacklist))
    }
}

/// Deterministic placement for tests and pinned deployments.
///
/// Nodes named in the preference list are tried in that order, then the
/// remaining nodes in the order they were listed by membership.
#[derive(Debug, Default, Clone)]
pub struct FixedPlacement {
    preferred: Vec<NodeId>,
}

impl FixedPlacement {
    pub fn new(preferred: Vec<NodeId>) -> Self {
        Self { preferred }
    }

    /// Parse a comma separated preference list, e.g. `"node-1,node-2"`.
    pub fn from_config(config: &str) -> Self {
        let preferred = config
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(NodeId::from)
            .collect();
        Self { preferred }
    }

    pub fn preferred(&self) -> &[NodeId] {
        &self.preferred
    }
}

impl PlacementStrategy for FixedPlacement {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn select_instance(
        &self,
        available: &[NodeInstance],
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<NodeInstance> {
        let preferred = self.preferred.iter().find_map(|id| {
            eligible(available, blacklist).find(|instance| &instance.id == id)
        });

        preferred
            .or_else(|| eligible(available, blacklist).next())
            .cloned()
            .ok_or_else(|| no_eligible_instance(available, blacklist))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Placement strategies that can be named in a group configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementStrategyKind {
    Random,
    LowestUtilization,
    Fixed,
}

impl PlacementStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementStrategyKind::Random => "random",
            PlacementStrategyKind::LowestUtilization => "lowest-utilization",
            PlacementStrategyKind::Fixed => "fixed",
        }
    }

    pub fn build(&self, config: &str) -> Box<dyn PlacementStrategy> {
        match self {
            PlacementStrategyKind::Random => Box::new(RandomPlacement),
            PlacementStrategyKind::LowestUtilization => Box::new(LowestUtilizationPlacement),
            PlacementStrategyKind::Fixed => Box::new(FixedPlacement::from_config(config)),
        }
    }
}

impl fmt::Display for PlacementStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(PlacementStrategyKind::Random),
            "lowest-utilization" | "lowest-cpu-load" => Ok(PlacementStrategyKind::LowestUtilization),
            "fixed" => Ok(PlacementStrategyKind::Fixed),
            other => Err(format!(
                "unknown placement strategy '{other}', expected one of: random, lowest-utilization, fixed"
            )),
        }
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Set `load` on each instance to the number of regions it hosts in `tree`.
pub fn with_tree_usage(mut nodes: Vec<NodeInstance>, tree: &RegionTree) -> Vec<NodeInstance> {
    let usage: HashMap<NodeId, u64> = tree.node_usage();
    for node in &mut nodes {
        node.load = usage.get(&node.id).copied().unwrap_or(0);
    }
    nodes
}

pub struct ResourceAllocator {
    strategy: Box<dyn PlacementStrategy>,
}

impl fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl ResourceAllocator {
    pub fn new(strategy: Box<dyn PlacementStrategy>) -> Self {
        Self { strategy }
    }

    pub fn for_kind(kind: PlacementStrategyKind, config: &str) -> Self {
        Self::new(kind.build(config))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Pick `replication` distinct ready nodes outside `blacklist`.
    pub fn allocate(
        &self,
        replication: usize,
        nodes: &[NodeInstance],
        blacklist: &BTreeSet<NodeId>,
    ) -> RegionResult<Vec<NodeInstance>> {
        let eligible_count = eligible(nodes, blacklist)
            .map(|instance| &instance.id)
            .collect::<BTreeSet<_>>()
            .len();

        if eligible_count < replication {
            metrics::record_allocation(self.strategy.name(), false);
            warn!(
                strategy = self.strategy.name(),
                required = replication,
                available = eligible_count,
                "Not enough nodes for replica allocation"
            );
            return Err(RegionError::ResourceAllocation {
                required: replication,
                available: eligible_count,
                reason: format!("{} nodes blacklisted", blacklist.len()),
            });
        }

        let mut blacklist = blacklist.clone();
        let mut selected = Vec::with_capacity(replication);
        for _ in 0..replication {
            let instance = match self.strategy.select_instance(nodes, &blacklist) {
                Ok(instance) => instance,
                Err(e) => {
                    metrics::record_allocation(self.strategy.name(), false);
                    return Err(e);
                }
            };
            blacklist.insert(instance.id.clone());
            selected.push(instance);
        }

        metrics::record_allocation(self.strategy.name(), true);
        debug!(
            strategy = self.strategy.name(),
            nodes = ?selected.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            "Allocated replicas"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::membership::NodeState;

    fn nodes(loads: &[(&str, u64)]) -> Vec<NodeInstance> {
        loads
            .iter()
            .map(|(id, load)| NodeInstance::ready(*id).with_load(*load))
            .collect()
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            "lowest-cpu-load".parse::<PlacementStrategyKind>().unwrap(),
            PlacementStrategyKind::LowestUtilization
        );
        assert_eq!(
            "Random".parse::<PlacementStrategyKind>().unwrap(),
            PlacementStrategyKind::Random
        );
        assert!("round-robin".parse::<PlacementStrategyKind>().is_err());
        for kind in [
            PlacementStrategyKind::Random,
            PlacementStrategyKind::LowestUtilization,
            PlacementStrategyKind::Fixed,
        ] {
            assert_eq!(kind.to_string().parse::<PlacementStrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_lowest_utilization_prefers_idle_nodes() {
        let available = nodes(&[("a", 5), ("b", 1), ("c", 1)]);
        let picked = LowestUtilizationPlacement
            .select_instance(&available, &BTreeSet::new())
            .unwrap();
        assert_eq!(picked.id, NodeId::from("b"));
    }

    #[test]
    fn test_strategies_skip_blacklisted_and_unready() {
        let mut available = nodes(&[("a", 0), ("b", 0), ("c", 0)]);
        available[1].state = NodeState::Failed;
        let blacklist: BTreeSet<NodeId> = [NodeId::from("a")].into();

        for strategy in [
            Box::new(RandomPlacement) as Box<dyn PlacementStrategy>,
            Box::new(LowestUtilizationPlacement),
            Box::new(FixedPlacement::default()),
        ] {
            let picked = strategy.select_instance(&available, &blacklist).unwrap();
            assert_eq!(picked.id, NodeId::from("c"), "strategy {}", strategy.name());
        }
    }

    #[test]
    fn test_fixed_preference_order() {
        let available = nodes(&[("a", 0), ("b", 0), ("c", 0)]);
        let strategy = FixedPlacement::from_config("c, b");
        let allocator = ResourceAllocator::new(Box::new(strategy));
        let picked: Vec<String> = allocator
            .allocate(3, &available, &BTreeSet::new())
            .unwrap()
            .into_iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(picked, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_allocate_distinct_nodes() {
        let available = nodes(&[("a", 0), ("b", 0), ("c", 0), ("d", 0)]);
        let allocator = ResourceAllocator::for_kind(PlacementStrategyKind::Random, "");
        for _ in 0..20 {
            let picked = allocator.allocate(3, &available, &BTreeSet::new()).unwrap();
            let distinct: BTreeSet<_> = picked.iter().map(|n| n.id.clone()).collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_allocate_fails_without_enough_nodes() {
        let available = nodes(&[("a", 0), ("b", 0)]);
        let allocator = ResourceAllocator::for_kind(PlacementStrategyKind::LowestUtilization, "");
        let err = allocator.allocate(3, &available, &BTreeSet::new()).unwrap_err();
        assert!(err.is_resource_allocation());
        match err {
            RegionError::ResourceAllocation {
                required, available, ..
            } => {
                assert_eq!(required, 3);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blacklist_counts_against_eligibility() {
        let available = nodes(&[("a", 0), ("b", 0), ("c", 0)]);
        let blacklist: BTreeSet<NodeId> = [NodeId::from("a")].into();
        let allocator = ResourceAllocator::for_kind(PlacementStrategyKind::Fixed, "");
        assert!(allocator.allocate(3, &available, &blacklist).is_err());
        assert_eq!(allocator.allocate(2, &available, &blacklist).unwrap().len(), 2);
    }

    #[test]
    fn test_zero_replication_is_empty() {
        let allocator = ResourceAllocator::for_kind(PlacementStrategyKind::Random, "");
        assert!(allocator.allocate(0, &[], &BTreeSet::new()).unwrap().is_empty());
    }
}
