//! Per-group partitioner cache.
//!
//! Partitioners are expensive: each owns a syncer with its own watch on the
//! coordination store. The cache keeps one per distribution group and keys
//! it on the group's version marker, so a group that was deleted and created
//! again under the same name gets a fresh partitioner.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{DistributionGroupConfig, PartitionerSettings};
use super::coordination::CoordinationStore;
use super::error::{RegionError, RegionResult};
use super::group::{DistributionGroupAdapter, validate_group_name};
use super::partitioner::{SpacePartitioner, SpacePartitionerContext, build_partitioner};
use super::paths::StorePaths;

struct CachedPartitioner {
    version: String,
    partitioner: Arc<dyn SpacePartitioner>,
}

pub struct SpacePartitionerCache {
    store: Arc<dyn CoordinationStore>,
    settings: PartitionerSettings,
    groups: DistributionGroupAdapter,
    entries: DashMap<String, CachedPartitioner>,
    /// Serializes partitioner construction so a group never gets two syncers.
    building: Mutex<()>,
}

impl SpacePartitionerCache {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        settings: PartitionerSettings,
    ) -> RegionResult<Self> {
        settings
            .validate()
            .map_err(|errors| RegionError::Configuration(errors.join("; ")))?;
        let paths = StorePaths::new(settings.cluster_name.clone())?;
        Ok(Self {
            groups: DistributionGroupAdapter::new(Arc::clone(&store), paths),
            store,
            settings,
            entries: DashMap::new(),
            building: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &PartitionerSettings {
        &self.settings
    }

    pub fn groups(&self) -> &DistributionGroupAdapter {
        &self.groups
    }

    fn cached(&self, group: &str, version: &str) -> Option<Arc<dyn SpacePartitioner>> {
        self.entries
            .get(group)
            .filter(|entry| entry.version == version)
            .map(|entry| Arc::clone(&entry.partitioner))
    }

    /// Partitioner of `group`, built on first use or after the group was
    /// recreated.
    pub async fn partitioner_for_group(
        &self,
        group: &str,
    ) -> RegionResult<Arc<dyn SpacePartitioner>> {
        validate_group_name(group)?;
        let version = self
            .groups
            .read_version(group)
            .await?
            .ok_or_else(|| RegionError::GroupNotFound(group.to_string()))?;
        if let Some(partitioner) = self.cached(group, &version) {
            return Ok(partitioner);
        }

        let _building = self.building.lock().await;
        if let Some(partitioner) = self.cached(group, &version) {
            return Ok(partitioner);
        }

        let config = self
            .groups
            .read_config(group)
            .await?
            .ok_or_else(|| RegionError::GroupNotFound(group.to_string()))?;
        let context = SpacePartitionerContext::open(
            Arc::clone(&self.store),
            self.settings.clone(),
            group,
            config,
        )
        .await?;
        let partitioner = build_partitioner(Arc::new(context))?;

        let previous = self.entries.insert(
            group.to_string(),
            CachedPartitioner {
                version: version.clone(),
                partitioner: Arc::clone(&partitioner),
            },
        );
        if let Some(previous) = previous {
            debug!(group, old_version = %previous.version, "Replacing outdated partitioner");
            previous.partitioner.shutdown();
        }

        debug!(group, version = %version, partitioner = %partitioner.kind(), "Built partitioner");
        Ok(partitioner)
    }

    /// Create a group and its root region.
    ///
    /// When the root cannot be created the group is deleted again.
    pub async fn create_group(
        &self,
        group: &str,
        config: &DistributionGroupConfig,
    ) -> RegionResult<Arc<dyn SpacePartitioner>> {
        self.groups.create_group(group, config).await?;

        let created = async {
            let partitioner = self.partitioner_for_group(group).await?;
            partitioner.create_root_node().await?;
            Ok::<_, RegionError>(partitioner)
        }
        .await;

        match created {
            Ok(partitioner) => {
                info!(group, partitioner = %partitioner.kind(), "Distribution group ready");
                Ok(partitioner)
            }
            Err(e) => {
                warn!(group, error = %e, "Failed to create root region, removing group");
                self.evict(group);
                if let Err(cleanup) = self.groups.delete_group(group).await {
                    warn!(group, error = %cleanup, "Failed to remove group after root creation failure");
                }
                Err(e)
            }
        }
    }

    /// Delete a group and drop its cached partitioner.
    pub async fn delete_group(&self, group: &str) -> RegionResult<()> {
        self.evict(group);
        self.groups.delete_group(group).await
    }

    /// Drop and shut down the cached partitioner of `group`, if any.
    pub fn evict(&self, group: &str) -> bool {
        match self.entries.remove(group) {
            Some((_, entry)) => {
                entry.partitioner.shutdown();
                true
            }
            None => false,
        }
    }

    /// Groups with a cached partitioner.
    pub fn cached_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    pub fn clear(&self) {
        let groups = self.cached_groups();
        for group in groups {
            self.evict(&group);
        }
    }
}

impl Drop for SpacePartitionerCache {
    fn drop(&mut self) {
        self.clear();
    }
}
