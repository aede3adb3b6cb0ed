//! Quad-tree partitioner.
//!
//! Only the root can be created; the tree never changes shape. Every split
//! and merge operation fails with [`RegionError::Unsupported`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::distribution::config::root_box_from_config;
use crate::distribution::error::{RegionError, RegionResult};
use crate::distribution::region::{Region, RegionId, RegionTree};
use crate::distribution::split_point::SampleSource;

use super::{PartitionerKind, SpacePartitioner, SpacePartitionerContext, unsupported};

pub struct QuadTreePartitioner {
    context: Arc<SpacePartitionerContext>,
}

impl QuadTreePartitioner {
    pub fn new(context: Arc<SpacePartitionerContext>) -> Self {
        Self { context }
    }

    fn unsupported(&self, operation: &'static str) -> RegionError {
        unsupported(PartitionerKind::QuadTree, operation)
    }
}

#[async_trait]
impl SpacePartitioner for QuadTreePartitioner {
    fn kind(&self) -> PartitionerKind {
        PartitionerKind::QuadTree
    }

    fn context(&self) -> &SpacePartitionerContext {
        &self.context
    }

    async fn create_root_node(&self) -> RegionResult<Arc<RegionTree>> {
        let config = self.context.config();
        let root_box = root_box_from_config(&config.space_partitioner_config, config.dimensions)?;
        self.context.create_leaf_root(&root_box).await
    }

    async fn split_region(
        &self,
        _region: RegionId,
        _samples: &dyn SampleSource,
    ) -> RegionResult<Vec<RegionId>> {
        Err(self.unsupported("split_region"))
    }

    async fn split_region_at(
        &self,
        _region: RegionId,
        _position: f64,
    ) -> RegionResult<Vec<RegionId>> {
        Err(self.unsupported("split_region"))
    }

    async fn split_complete(&self, _source: RegionId, _children: &[RegionId]) -> RegionResult<()> {
        Err(self.unsupported("split_complete"))
    }

    async fn split_failed(&self, _source: RegionId, _children: &[RegionId]) -> RegionResult<()> {
        Err(self.unsupported("split_failed"))
    }

    async fn destination_for_merge(&self, _sources: &[RegionId]) -> RegionResult<RegionId> {
        Err(self.unsupported("destination_for_merge"))
    }

    async fn prepare_merge(
        &self,
        _sources: &[RegionId],
        _destination: RegionId,
    ) -> RegionResult<()> {
        Err(self.unsupported("prepare_merge"))
    }

    async fn merge_complete(
        &self,
        _sources: &[RegionId],
        _destination: RegionId,
    ) -> RegionResult<()> {
        Err(self.unsupported("merge_complete"))
    }

    async fn merge_failed(
        &self,
        _sources: &[RegionId],
        _destination: RegionId,
    ) -> RegionResult<()> {
        Err(self.unsupported("merge_failed"))
    }

    fn is_splitable(&self, _region: &Region) -> bool {
        false
    }

    fn is_merging_supported(&self, _region: &Region) -> bool {
        false
    }

    fn merge_candidates(&self, _region: &Region) -> Vec<Vec<RegionId>> {
        Vec::new()
    }
}
