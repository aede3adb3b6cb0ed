//! Grid partitioners.
//!
//! All three layouts cut the configured covering box into cells of the
//! configured step size, the last cell of each dimension ending at the box
//! edge. They differ in how the cells hang below the root:
//!
//! ```text
//!  static   root ── cell ── cell ── cell ...            (flat)
//!  fixed    root ── dim 0 slice ── dim 1 slice ── ...   (nested, dim 0 first)
//!  dynamic  root ── dim d-1 slice ── ... ── dim 0 cell  (nested, dim 0 last)
//! ```
//!
//! Static and fixed grids never change shape. Dynamic grid leaves are siblings
//! along dimension 0 and can be split and merged along that dimension; the
//! new regions are created next to the source, which is deleted afterwards.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::distribution::config::GridConfig;
use crate::distribution::error::{RegionError, RegionResult};
use crate::distribution::membership::NodeId;
use crate::distribution::paths::child_path;
use crate::distribution::region::{Region, RegionId, RegionState, RegionTree};
use crate::distribution::split_point::{SampleSource, strategy_for_samples};
use crate::hyperrectangle::{DoubleInterval, Hyperrectangle};

use super::{
    PartitionerKind, SpacePartitioner, SpacePartitionerContext, SplitLayout, unsupported,
};

/// Dimension merges and dynamic splits operate on.
const SPLIT_DIMENSION: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridLayout {
    Fixed,
    Static,
    Dynamic,
}

impl GridLayout {
    fn kind(&self) -> PartitionerKind {
        match self {
            GridLayout::Fixed => PartitionerKind::FixedGrid,
            GridLayout::Static => PartitionerKind::StaticGrid,
            GridLayout::Dynamic => PartitionerKind::DynamicGrid,
        }
    }
}

pub struct GridPartitioner {
    context: Arc<SpacePartitionerContext>,
    layout: GridLayout,
    grid: GridConfig,
}

/// A region still to be written while building the grid.
struct PendingCell {
    path: String,
    bounding_box: Hyperrectangle,
    depth: usize,
}

impl GridPartitioner {
    pub fn new(context: Arc<SpacePartitionerContext>, layout: GridLayout) -> RegionResult<Self> {
        let config = context.config();
        let grid = GridConfig::parse(&config.space_partitioner_config, config.dimensions)?;
        Ok(Self {
            context,
            layout,
            grid,
        })
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    /// Interval of cell `index` along `dimension`.
    fn cell_interval(&self, dimension: usize, index: usize) -> RegionResult<DoubleInterval> {
        let covering = self.grid.covering_box.interval(dimension)?;
        let step = self.grid.steps[dimension];
        let low = covering.low() + step * index as f64;
        let high = if index + 1 >= self.grid.cells_in_dimension(dimension) {
            covering.high()
        } else {
            covering.low() + step * (index + 1) as f64
        };
        Ok(DoubleInterval::new(low, high)?)
    }

    fn with_interval(
        bounding_box: &Hyperrectangle,
        dimension: usize,
        interval: DoubleInterval,
    ) -> Hyperrectangle {
        let mut intervals = bounding_box.intervals().to_vec();
        intervals[dimension] = interval;
        Hyperrectangle::new(intervals)
    }

    /// Dimensions in the order the nesting levels cut them.
    fn level_dimensions(&self) -> Vec<usize> {
        let dimensions = self.grid.steps.len();
        match self.layout {
            GridLayout::Fixed | GridLayout::Static => (0..dimensions).collect(),
            GridLayout::Dynamic => (0..dimensions).rev().collect(),
        }
    }

    /// Child regions of a pending cell, one per slice of the next dimension.
    fn slices(&self, cell: &PendingCell, dimension: usize) -> RegionResult<Vec<PendingCell>> {
        (0..self.grid.cells_in_dimension(dimension))
            .map(|index| {
                Ok(PendingCell {
                    path: child_path(&cell.path, index as u32),
                    bounding_box: Self::with_interval(
                        &cell.bounding_box,
                        dimension,
                        self.cell_interval(dimension, index)?,
                    ),
                    depth: cell.depth + 1,
                })
            })
            .collect()
    }

    /// Every cell directly below the root, row-major with the last dimension
    /// varying fastest.
    fn flat_cells(&self, root_path: &str) -> RegionResult<Vec<PendingCell>> {
        let dimensions = self.grid.steps.len();
        let mut cells = Vec::with_capacity(self.grid.cell_count());
        for flat in 0..self.grid.cell_count() {
            let mut remainder = flat;
            let mut intervals = vec![DoubleInterval::UNBOUNDED; dimensions];
            for dimension in (0..dimensions).rev() {
                let count = self.grid.cells_in_dimension(dimension);
                intervals[dimension] = self.cell_interval(dimension, remainder % count)?;
                remainder /= count;
            }
            cells.push(PendingCell {
                path: child_path(root_path, flat as u32),
                bounding_box: Hyperrectangle::new(intervals),
                depth: dimensions,
            });
        }
        Ok(cells)
    }

    /// Write all inner regions and leaf cells. Returns the leaf paths and ids.
    async fn write_cells(&self, root_path: &str) -> RegionResult<Vec<(String, RegionId)>> {
        let context = &self.context;
        let dimensions = self.grid.steps.len();
        let mut leaves = Vec::with_capacity(self.grid.cell_count());

        if self.layout == GridLayout::Static {
            for cell in self.flat_cells(root_path)? {
                let id = context
                    .create_region(&cell.path, &cell.bounding_box, RegionState::Creating)
                    .await?;
                leaves.push((cell.path, id));
            }
            return Ok(leaves);
        }

        let levels = self.level_dimensions();
        let root = PendingCell {
            path: root_path.to_string(),
            bounding_box: self.grid.covering_box.clone(),
            depth: 0,
        };
        let mut pending: VecDeque<PendingCell> = self.slices(&root, levels[0])?.into();
        while let Some(cell) = pending.pop_front() {
            let is_leaf = cell.depth == dimensions;
            let state = if is_leaf {
                RegionState::Creating
            } else {
                RegionState::Split
            };
            let id = context
                .create_region(&cell.path, &cell.bounding_box, state)
                .await?;
            if is_leaf {
                leaves.push((cell.path, id));
            } else {
                pending.extend(self.slices(&cell, levels[cell.depth])?);
            }
        }
        Ok(leaves)
    }

    /// Place replicas for every leaf, spreading them over the nodes.
    ///
    /// Leaves that cannot be placed stay `CREATING`.
    async fn place_leaves(
        &self,
        leaves: &[(String, RegionId)],
    ) -> RegionResult<HashMap<RegionId, RegionState>> {
        let context = &self.context;
        let nodes = context.membership().nodes().await?;
        let replication = context.config().replication_factor as usize;
        let mut usage: HashMap<NodeId, u64> = HashMap::new();
        let mut expected = HashMap::with_capacity(leaves.len());
        let mut unplaced = 0usize;

        for (path, id) in leaves {
            let loaded: Vec<_> = nodes
                .iter()
                .cloned()
                .map(|node| {
                    let load = usage.get(&node.id).copied().unwrap_or(0);
                    node.with_load(load)
                })
                .collect();

            match context
                .allocator()
                .allocate(replication, &loaded, &BTreeSet::new())
            {
                Ok(picked) => {
                    let systems: BTreeSet<NodeId> =
                        picked.into_iter().map(|instance| instance.id).collect();
                    for system in &systems {
                        *usage.entry(system.clone()).or_default() += 1;
                    }
                    context.regions().set_systems(path, &systems).await?;
                    context
                        .regions()
                        .set_state(path, RegionState::Active)
                        .await?;
                    expected.insert(*id, RegionState::Active);
                }
                Err(e) if e.is_resource_allocation() => {
                    unplaced += 1;
                    expected.insert(*id, RegionState::Creating);
                }
                Err(e) => return Err(e),
            }
        }

        if unplaced > 0 {
            warn!(
                group = %context.group(),
                unplaced,
                cells = leaves.len(),
                "Grid cells left without replicas"
            );
        }
        Ok(expected)
    }

    fn require_dynamic(&self, operation: &'static str) -> RegionResult<()> {
        if self.layout == GridLayout::Dynamic {
            Ok(())
        } else {
            Err(unsupported(self.layout.kind(), operation))
        }
    }

    /// Active leaf siblings of `region` touching it along the split dimension
    /// with identical extent in every other dimension.
    fn neighbours(tree: &RegionTree, region: &Region) -> Vec<RegionId> {
        let Some(parent) = region.parent else {
            return Vec::new();
        };
        let Ok(own) = region.bounding_box.interval(SPLIT_DIMENSION) else {
            return Vec::new();
        };

        tree.children(parent)
            .into_iter()
            .filter(|sibling| sibling.id != region.id)
            .filter(|sibling| sibling.is_leaf() && sibling.state.is_active())
            .filter(|sibling| Self::same_extent_off_axis(&region.bounding_box, &sibling.bounding_box))
            .filter(|sibling| {
                sibling
                    .bounding_box
                    .interval(SPLIT_DIMENSION)
                    .is_ok_and(|other| other.high() == own.low() || other.low() == own.high())
            })
            .map(|sibling| sibling.id)
            .collect()
    }

    fn same_extent_off_axis(a: &Hyperrectangle, b: &Hyperrectangle) -> bool {
        a.dimensions() == b.dimensions()
            && a.intervals()
                .iter()
                .zip(b.intervals())
                .enumerate()
                .all(|(dimension, (x, y))| dimension == SPLIT_DIMENSION || x == y)
    }

    /// Check `sources` form one contiguous run of siblings along the split
    /// dimension and return their covering box and parent.
    fn check_merge_sources(
        tree: &RegionTree,
        sources: &[RegionId],
    ) -> RegionResult<(RegionId, Hyperrectangle)> {
        if sources.len() < 2 {
            return Err(RegionError::configuration(
                "a merge needs at least two regions",
            ));
        }

        let mut regions = sources
            .iter()
            .map(|id| tree.region(*id))
            .collect::<RegionResult<Vec<_>>>()?;
        let parent = regions[0].parent;
        for region in &regions {
            if region.parent.is_none() || region.parent != parent || !region.is_leaf() {
                return Err(RegionError::configuration(format!(
                    "region {} is not a leaf sibling of region {}",
                    region.id, regions[0].id
                )));
            }
        }

        regions.sort_by(|a, b| a.bounding_box.cmp_by_low(&b.bounding_box));
        for pair in regions.windows(2) {
            let touching = pair[0].bounding_box.high(SPLIT_DIMENSION)?
                == pair[1].bounding_box.low(SPLIT_DIMENSION)?;
            if !touching || !Self::same_extent_off_axis(&pair[0].bounding_box, &pair[1].bounding_box)
            {
                return Err(RegionError::configuration(format!(
                    "regions {} and {} are not adjacent",
                    pair[0].id, pair[1].id
                )));
            }
        }

        let covering = Hyperrectangle::covering_box(regions.iter().map(|r| &r.bounding_box));
        let parent = parent.ok_or_else(|| RegionError::configuration("cannot merge the root"))?;
        Ok((parent, covering))
    }
}

#[async_trait]
impl SpacePartitioner for GridPartitioner {
    fn kind(&self) -> PartitionerKind {
        self.layout.kind()
    }

    fn context(&self) -> &SpacePartitionerContext {
        &self.context
    }

    async fn create_root_node(&self) -> RegionResult<Arc<RegionTree>> {
        let context = &self.context;
        let root_path = context.ensure_no_root().await?;
        let root = context
            .create_region(&root_path, &self.grid.covering_box, RegionState::Creating)
            .await?;

        let leaves = self.write_cells(&root_path).await?;
        let expected = self.place_leaves(&leaves).await?;
        context
            .regions()
            .set_state(&root_path, RegionState::Split)
            .await?;

        let tree = context
            .wait_until(format!("grid of {} cells", leaves.len()), |tree| {
                tree.root_id() == root
                    && tree.root().state == RegionState::Split
                    && expected
                        .iter()
                        .all(|(id, state)| tree.get(*id).is_some_and(|r| r.state == *state))
            })
            .await?;

        info!(
            group = %context.group(),
            partitioner = %self.kind(),
            cells = leaves.len(),
            "Created grid"
        );
        Ok(tree)
    }

    async fn split_region(
        &self,
        region: RegionId,
        samples: &dyn SampleSource,
    ) -> RegionResult<Vec<RegionId>> {
        self.require_dynamic("split_region")?;
        let tree = self.context.tree().await?;
        let source = tree.region(region)?;
        if !self.is_splitable(source) {
            return Err(RegionError::InvalidState {
                region,
                actual: source.state,
                expected: "an active leaf".to_string(),
            });
        }

        let strategy = strategy_for_samples(samples.sample(source).await?);
        let position = strategy.split_point(SPLIT_DIMENSION, &source.bounding_box)?;
        self.split_region_at(region, position).await
    }

    async fn split_region_at(
        &self,
        region: RegionId,
        position: f64,
    ) -> RegionResult<Vec<RegionId>> {
        self.require_dynamic("split_region")?;
        self.context
            .split_node(self.kind(), region, SPLIT_DIMENSION, position, SplitLayout::Beside)
            .await
    }

    async fn split_complete(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()> {
        self.require_dynamic("split_complete")?;
        self.context
            .complete_split(self.kind(), source, children, SplitLayout::Beside)
            .await
    }

    async fn split_failed(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()> {
        self.require_dynamic("split_failed")?;
        self.context
            .fail_split(self.kind(), source, children, SplitLayout::Beside)
            .await
    }

    /// A new sibling covering all of `sources`, with freshly placed replicas.
    async fn destination_for_merge(&self, sources: &[RegionId]) -> RegionResult<RegionId> {
        self.require_dynamic("destination_for_merge")?;
        let context = &self.context;
        let tree = context.tree().await?;
        let (parent, covering) = Self::check_merge_sources(&tree, sources)?;

        let parent_path = context.region_path(&tree, parent)?;
        let number = context
            .regions()
            .read_child_numbers(&parent_path)
            .await?
            .last()
            .map_or(0, |highest| highest + 1);
        let path = child_path(&parent_path, number);
        let destination = context
            .create_region(&path, &covering, RegionState::Creating)
            .await?;

        if let Err(e) = context.allocate_into(&path, Some(&tree), &BTreeSet::new()).await {
            if let Err(cleanup) = context.regions().delete_region(&path).await {
                warn!(path, error = %cleanup, "Failed to delete unplaced merge destination");
            }
            return Err(e);
        }

        context
            .wait_until(format!("merge destination {destination}"), |tree| {
                tree.contains(destination)
            })
            .await?;
        Ok(destination)
    }

    async fn prepare_merge(
        &self,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        self.require_dynamic("prepare_merge")?;
        self.context
            .prepare_merge_states(self.kind(), sources, destination)
            .await
    }

    async fn merge_complete(
        &self,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        self.require_dynamic("merge_complete")?;
        self.context
            .complete_merge(self.kind(), sources, destination)
            .await
    }

    async fn merge_failed(&self, sources: &[RegionId], destination: RegionId) -> RegionResult<()> {
        self.require_dynamic("merge_failed")?;
        self.context
            .fail_merge(self.kind(), sources, destination, None)
            .await
    }

    fn is_splitable(&self, region: &Region) -> bool {
        self.layout == GridLayout::Dynamic
            && !region.is_root()
            && region.is_leaf()
            && region.state == RegionState::Active
    }

    fn is_merging_supported(&self, region: &Region) -> bool {
        self.layout == GridLayout::Dynamic
            && !region.is_root()
            && region.is_leaf()
            && region.state.is_active()
    }

    /// Pairs of `region` with each adjacent sibling, lower region first.
    fn merge_candidates(&self, region: &Region) -> Vec<Vec<RegionId>> {
        if !self.is_merging_supported(region) {
            return Vec::new();
        }
        let Some(tree) = self.context.syncer().snapshot() else {
            return Vec::new();
        };

        let mut candidates: Vec<Vec<RegionId>> = Self::neighbours(&tree, region)
            .into_iter()
            .filter_map(|neighbour| tree.get(neighbour))
            .map(|neighbour| {
                if neighbour.bounding_box.cmp_by_low(&region.bounding_box).is_lt() {
                    vec![neighbour.id, region.id]
                } else {
                    vec![region.id, neighbour.id]
                }
            })
            .collect();
        candidates.sort();
        candidates
    }
}
