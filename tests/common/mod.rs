//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regiontree::distribution::{
    ClusterMembership, CoordinationStore, DistributionGroupConfig, InMemoryCoordinationStore,
    NodeId, NodeState, PartitionerSettings, RegionEvent, SpacePartitioner, SpacePartitionerCache,
    StorePaths,
};

pub const CLUSTER: &str = "test-cluster";

pub fn settings() -> PartitionerSettings {
    PartitionerSettings::default()
        .with_cluster_name(CLUSTER)
        .with_structure_wait_timeout(Duration::from_secs(5))
        .with_mapping_wait_timeout(Duration::from_secs(2))
}

pub struct TestCluster {
    pub store: Arc<InMemoryCoordinationStore>,
    pub cache: SpacePartitionerCache,
}

impl TestCluster {
    /// A cluster with `nodes` ready nodes named `node-0`, `node-1`, ...
    pub async fn new(nodes: usize) -> Self {
        Self::with_settings(nodes, settings()).await
    }

    pub async fn with_settings(nodes: usize, settings: PartitionerSettings) -> Self {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let membership = ClusterMembership::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            StorePaths::new(CLUSTER).unwrap(),
        );
        for i in 0..nodes {
            membership
                .register_node(&NodeId::new(format!("node-{i}")), NodeState::Ready)
                .await
                .unwrap();
        }
        let cache =
            SpacePartitionerCache::new(Arc::clone(&store) as Arc<dyn CoordinationStore>, settings)
                .unwrap();
        Self { store, cache }
    }

    pub fn dyn_store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store) as Arc<dyn CoordinationStore>
    }

    pub async fn create_group(
        &self,
        group: &str,
        config: DistributionGroupConfig,
    ) -> Arc<dyn SpacePartitioner> {
        self.cache.create_group(group, &config).await.unwrap()
    }
}

pub fn kdtree_config(dimensions: u32) -> DistributionGroupConfig {
    DistributionGroupConfig::builder(dimensions)
        .replication_factor(1)
        .build()
}

pub fn grid_config(kind: &str, grid: &str, dimensions: u32) -> DistributionGroupConfig {
    DistributionGroupConfig::builder(dimensions)
        .replication_factor(1)
        .space_partitioner(kind, grid)
        .build()
}

/// Collects every event delivered to a callback.
pub fn recorder() -> (
    Arc<Mutex<Vec<RegionEvent>>>,
    impl Fn(&RegionEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &RegionEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}
