//! KD-tree partitioner.
//!
//! Every split cuts a leaf in two along dimension `level % dimensions`, so the
//! tree alternates split axes by depth. The split source stays in the tree as
//! an inner node in state `SPLIT`; merging its two children turns it back into
//! a leaf.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::distribution::config::root_box_from_config;
use crate::distribution::error::{RegionError, RegionResult};
use crate::distribution::region::{Region, RegionId, RegionState, RegionTree};
use crate::distribution::split_point::{SampleSource, strategy_for_samples};
use crate::hyperrectangle::Hyperrectangle;

use super::{
    PartitionerKind, SpacePartitioner, SpacePartitionerContext, SplitLayout, mergeable_siblings,
};

pub struct KdTreePartitioner {
    context: Arc<SpacePartitionerContext>,
    root_box: Hyperrectangle,
}

impl KdTreePartitioner {
    /// The partitioner config may carry a box literal restricting the root.
    pub fn new(context: Arc<SpacePartitionerContext>) -> RegionResult<Self> {
        let config = context.config();
        let root_box = root_box_from_config(&config.space_partitioner_config, config.dimensions)?;
        Ok(Self { context, root_box })
    }

    pub fn root_box(&self) -> &Hyperrectangle {
        &self.root_box
    }

    fn split_dimension(&self, region: &Region) -> usize {
        region.level as usize % self.context.config().dimensions as usize
    }

    /// Children of an inner region when all of them are active leaves.
    fn mergeable_children(tree: &RegionTree, region: &Region) -> Option<Vec<RegionId>> {
        if region.state != RegionState::Split {
            return None;
        }
        let first = tree.children(region.id).into_iter().next()?;
        mergeable_siblings(tree, first)
    }
}

#[async_trait]
impl SpacePartitioner for KdTreePartitioner {
    fn kind(&self) -> PartitionerKind {
        PartitionerKind::KdTree
    }

    fn context(&self) -> &SpacePartitionerContext {
        &self.context
    }

    async fn create_root_node(&self) -> RegionResult<Arc<RegionTree>> {
        self.context.create_leaf_root(&self.root_box).await
    }

    async fn split_region(
        &self,
        region: RegionId,
        samples: &dyn SampleSource,
    ) -> RegionResult<Vec<RegionId>> {
        let tree = self.context.tree().await?;
        let source = tree.region(region)?;
        if !self.is_splitable(source) {
            return Err(RegionError::InvalidState {
                region,
                actual: source.state,
                expected: "an active leaf".to_string(),
            });
        }

        let dimension = self.split_dimension(source);
        let strategy = strategy_for_samples(samples.sample(source).await?);
        let position = strategy.split_point(dimension, &source.bounding_box)?;
        self.context
            .split_node(self.kind(), region, dimension, position, SplitLayout::Below)
            .await
    }

    async fn split_region_at(
        &self,
        region: RegionId,
        position: f64,
    ) -> RegionResult<Vec<RegionId>> {
        let tree = self.context.tree().await?;
        let dimension = self.split_dimension(tree.region(region)?);
        self.context
            .split_node(self.kind(), region, dimension, position, SplitLayout::Below)
            .await
    }

    async fn split_complete(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()> {
        self.context
            .complete_split(self.kind(), source, children, SplitLayout::Below)
            .await
    }

    async fn split_failed(&self, source: RegionId, children: &[RegionId]) -> RegionResult<()> {
        self.context
            .fail_split(self.kind(), source, children, SplitLayout::Below)
            .await
    }

    /// The common parent, which must be `SPLIT` and have exactly `sources`
    /// as children.
    async fn destination_for_merge(&self, sources: &[RegionId]) -> RegionResult<RegionId> {
        let Some(first) = sources.first() else {
            return Err(RegionError::configuration("no regions to merge"));
        };
        let tree = self.context.tree().await?;
        let region = tree.region(*first)?;
        let parent = region
            .parent
            .and_then(|parent| tree.get(parent))
            .ok_or_else(|| RegionError::InvalidState {
                region: *first,
                actual: region.state,
                expected: "a region with a parent".to_string(),
            })?;

        if parent.state != RegionState::Split {
            return Err(RegionError::InvalidState {
                region: parent.id,
                actual: parent.state,
                expected: RegionState::Split.to_string(),
            });
        }

        let requested: BTreeSet<RegionId> = sources.iter().copied().collect();
        let children: BTreeSet<RegionId> = parent.children.values().copied().collect();
        if requested != children {
            return Err(RegionError::configuration(format!(
                "regions {requested:?} are not all children of region {}",
                parent.id
            )));
        }
        Ok(parent.id)
    }

    async fn prepare_merge(
        &self,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        let tree = self.context.tree().await?;
        let destination_path = self.context.region_path(&tree, destination)?;
        self.context
            .regions()
            .set_to_split_merging(&destination_path)
            .await?;

        let prepared = self
            .context
            .prepare_merge_states(self.kind(), sources, destination)
            .await;
        if prepared.is_err() {
            if let Err(e) = self
                .context
                .regions()
                .set_state(&destination_path, RegionState::Split)
                .await
            {
                warn!(region_id = %destination, error = %e, "Failed to reset merge destination");
            }
        }
        prepared
    }

    async fn merge_complete(
        &self,
        sources: &[RegionId],
        destination: RegionId,
    ) -> RegionResult<()> {
        self.context
            .complete_merge(self.kind(), sources, destination)
            .await
    }

    async fn merge_failed(&self, sources: &[RegionId], destination: RegionId) -> RegionResult<()> {
        self.context
            .fail_merge(self.kind(), sources, destination, Some(RegionState::Split))
            .await
    }

    fn is_splitable(&self, region: &Region) -> bool {
        region.is_leaf() && region.state == RegionState::Active
    }

    fn is_merging_supported(&self, region: &Region) -> bool {
        self.context
            .syncer()
            .snapshot()
            .is_some_and(|tree| Self::mergeable_children(&tree, region).is_some())
    }

    /// For an inner region its children, for a leaf its siblings.
    fn merge_candidates(&self, region: &Region) -> Vec<Vec<RegionId>> {
        let Some(tree) = self.context.syncer().snapshot() else {
            return Vec::new();
        };
        let candidates = if region.is_leaf() {
            region
                .parent
                .and_then(|parent| tree.get(parent))
                .and_then(|parent| Self::mergeable_children(&tree, parent))
        } else {
            Self::mergeable_children(&tree, region)
        };
        candidates.into_iter().collect()
    }
}
