//! Distribution group administration.
//!
//! A group is created by writing its configuration and a fresh version
//! marker. The region tree itself is created afterwards by the group's
//! partitioner (see [`SpacePartitionerCache::create_group`](super::SpacePartitionerCache::create_group)).
//! Deleting a group removes its whole subtree, including all regions.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::config::DistributionGroupConfig;
use super::coordination::CoordinationStore;
use super::error::{CoordinationError, RegionError, RegionResult};
use super::paths::StorePaths;
use super::region::RegionId;

/// Group names are used in store paths and table names.
pub fn validate_group_name(name: &str) -> RegionResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(RegionError::configuration(format!(
            "invalid distribution group name '{name}'"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DistributionGroupAdapter {
    store: Arc<dyn CoordinationStore>,
    paths: StorePaths,
}

impl DistributionGroupAdapter {
    pub fn new(store: Arc<dyn CoordinationStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Write the configuration and version marker of a new group.
    pub async fn create_group(
        &self,
        name: &str,
        config: &DistributionGroupConfig,
    ) -> RegionResult<()> {
        validate_group_name(name)?;
        config.check()?;

        let group_path = self.paths.group_path(name);
        match self.store.create_node(&group_path, Bytes::new()).await {
            Ok(()) => {}
            Err(CoordinationError::NodeExists(_)) => {
                return Err(RegionError::GroupExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let encoded = serde_json::to_vec(config)?;
        self.store
            .create_node(&self.paths.group_config_path(name), Bytes::from(encoded))
            .await?;
        self.write_version_marker(name).await?;

        info!(
            group = name,
            dimensions = config.dimensions,
            partitioner = %config.space_partitioner,
            "Created distribution group"
        );
        Ok(())
    }

    /// Replace the version marker; every syncer of the group rebuilds its tree.
    pub async fn write_version_marker(&self, name: &str) -> RegionResult<String> {
        let marker = format!(
            "{}-{:08x}",
            chrono::Utc::now().timestamp_millis(),
            fastrand::u32(..)
        );
        self.store
            .set_data(
                &self.paths.group_version_path(name),
                Bytes::from(marker.clone()),
            )
            .await?;
        debug!(group = name, version = %marker, "Wrote group version marker");
        Ok(marker)
    }

    /// Delete a group and all of its regions. Deleting an absent group is a no-op.
    pub async fn delete_group(&self, name: &str) -> RegionResult<()> {
        validate_group_name(name)?;
        self.store
            .delete_recursive(&self.paths.group_path(name))
            .await?;
        info!(group = name, "Deleted distribution group");
        Ok(())
    }

    pub async fn group_exists(&self, name: &str) -> RegionResult<bool> {
        Ok(self.store.exists(&self.paths.group_path(name)).await?)
    }

    pub async fn list_groups(&self) -> RegionResult<Vec<String>> {
        match self.store.get_children(&self.paths.groups_path()).await {
            Ok(groups) => Ok(groups),
            Err(CoordinationError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored configuration, `None` when the group does not exist.
    pub async fn read_config(&self, name: &str) -> RegionResult<Option<DistributionGroupConfig>> {
        match self
            .store
            .read_node(&self.paths.group_config_path(name))
            .await
        {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(CoordinationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current version marker, `None` when the group does not exist.
    pub async fn read_version(&self, name: &str) -> RegionResult<Option<String>> {
        match self
            .store
            .read_string(&self.paths.group_version_path(name))
            .await
        {
            Ok(version) => Ok(Some(version)),
            Err(CoordinationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate the next region id. Ids strictly increase and are never reused.
    pub async fn next_region_id(&self, name: &str) -> RegionResult<RegionId> {
        let prefix = self.paths.region_id_queue_prefix(name);
        let path = self
            .store
            .create_sequential_node(&prefix, Bytes::new())
            .await?;
        let sequence = path
            .strip_prefix(&prefix)
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| RegionError::malformed(&path, "not a sequential id node"))?;
        Ok(RegionId(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::coordination::InMemoryCoordinationStore;

    fn adapter() -> DistributionGroupAdapter {
        DistributionGroupAdapter::new(
            Arc::new(InMemoryCoordinationStore::new()),
            StorePaths::new("test").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let adapter = adapter();
        let config = DistributionGroupConfig::default();

        adapter.create_group("points", &config).await.unwrap();
        assert!(adapter.group_exists("points").await.unwrap());
        assert_eq!(adapter.read_config("points").await.unwrap(), Some(config));
        assert!(adapter.read_version("points").await.unwrap().is_some());
        assert_eq!(adapter.list_groups().await.unwrap(), vec!["points"]);

        adapter.delete_group("points").await.unwrap();
        assert!(!adapter.group_exists("points").await.unwrap());
        assert_eq!(adapter.read_config("points").await.unwrap(), None);
        assert_eq!(adapter.read_version("points").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_existing_group_fails() {
        let adapter = adapter();
        let config = DistributionGroupConfig::default();
        adapter.create_group("g", &config).await.unwrap();
        assert!(matches!(
            adapter.create_group("g", &config).await,
            Err(RegionError::GroupExists(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_name_or_config_rejected() {
        let adapter = adapter();
        assert!(
            adapter
                .create_group("bad_name", &DistributionGroupConfig::default())
                .await
                .is_err()
        );

        let config = DistributionGroupConfig {
            dimensions: 0,
            ..Default::default()
        };
        assert!(matches!(
            adapter.create_group("g", &config).await,
            Err(RegionError::Configuration(_))
        ));
        assert!(!adapter.group_exists("g").await.unwrap());
    }

    #[tokio::test]
    async fn test_region_ids_strictly_increase() {
        let adapter = adapter();
        adapter
            .create_group("g", &DistributionGroupConfig::default())
            .await
            .unwrap();

        let mut previous = adapter.next_region_id("g").await.unwrap();
        for _ in 0..20 {
            let next = adapter.next_region_id("g").await.unwrap();
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_version_marker_changes() {
        let adapter = adapter();
        let first = adapter.write_version_marker("g").await.unwrap();
        let second = adapter.write_version_marker("g").await.unwrap();
        assert_ne!(first, second);
    }
}
