//! Integration tests for the KD-tree partitioner.
//!
//! These tests drive complete split and merge cycles against the in-memory
//! coordination store and check the mirrored tree after every step.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{TestCluster, kdtree_config, recorder, settings};
use regiontree::distribution::{
    CoordinationError, NodeId, RegionError, RegionEventKind, RegionState, StaticSamples,
};
use regiontree::hyperrectangle::Hyperrectangle;

fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(|name| NodeId::new(*name)).collect()
}

// ============================================================================
// Root creation
// ============================================================================

#[tokio::test]
async fn test_root_covers_full_space() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;

    let tree = partitioner.root_node().await.unwrap().unwrap();
    assert_eq!(tree.len(), 1);
    let root = tree.root();
    assert_eq!(root.state, RegionState::Active);
    assert_eq!(root.bounding_box, Hyperrectangle::full_space(2));
    assert_eq!(root.systems, nodes(&["node-0"]));
    assert!(partitioner.is_splitable(root));
}

#[tokio::test]
async fn test_root_box_from_partitioner_config() {
    let cluster = TestCluster::new(1).await;
    let config = regiontree::distribution::DistributionGroupConfig::builder(2)
        .replication_factor(1)
        .space_partitioner("kdtree", "[[0.0,10.0]:[0.0,10.0]]")
        .build();
    let partitioner = cluster.create_group("bounded", config).await;

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(
        tree.root().bounding_box,
        Hyperrectangle::from_pairs(&[(0.0, 10.0), (0.0, 10.0)]).unwrap()
    );
}

#[tokio::test]
async fn test_root_stays_creating_without_nodes() {
    let cluster = TestCluster::new(0).await;
    let partitioner = cluster.create_group("empty", kdtree_config(2)).await;

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Creating);
    assert!(tree.root().systems.is_empty());
}

#[tokio::test]
async fn test_create_root_twice_fails() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    assert!(matches!(
        partitioner.create_root_node().await,
        Err(RegionError::GroupExists(_))
    ));
}

// ============================================================================
// Splits
// ============================================================================

#[tokio::test]
async fn test_split_creates_two_children() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    assert_eq!(children.len(), 2);

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(root).unwrap().state, RegionState::Splitting);

    let low = tree.region(children[0]).unwrap();
    let high = tree.region(children[1]).unwrap();
    assert_eq!(low.state, RegionState::RedistributionActive);
    assert_eq!(high.state, RegionState::RedistributionActive);
    assert_eq!(low.bounding_box.high(0).unwrap(), 0.0);
    assert_eq!(high.bounding_box.low(0).unwrap(), 0.0);
    assert_eq!(low.level, 1);

    // Low half keeps the source replicas, the high half avoids them
    assert_eq!(low.systems, nodes(&["node-0"]));
    assert_eq!(high.systems, nodes(&["node-1"]));
    assert!(tree.partition_violations().is_empty());
}

#[tokio::test]
async fn test_split_complete_activates_children() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Split);
    for child in &children {
        assert_eq!(tree.region(*child).unwrap().state, RegionState::Active);
    }
    assert!(!partitioner.is_splitable(tree.root()));
    assert!(partitioner.is_merging_supported(tree.root()));
}

#[tokio::test]
async fn test_split_dimension_follows_level() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();

    let grandchildren = partitioner.split_region_at(children[0], 5.0).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    let low = tree.region(grandchildren[0]).unwrap();
    assert_eq!(low.level, 2);
    assert_eq!(low.bounding_box.high(0).unwrap(), 0.0);
    assert_eq!(low.bounding_box.high(1).unwrap(), 5.0);
    assert!(tree.partition_violations().is_empty());
}

#[tokio::test]
async fn test_split_uses_sample_median() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let samples = StaticSamples(
        [1.0, 2.0, 3.0]
            .iter()
            .map(|x| Hyperrectangle::from_pairs(&[(*x, *x), (0.0, 0.0)]).unwrap())
            .collect(),
    );
    let children = partitioner.split_region(root, &samples).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(children[0]).unwrap().bounding_box.high(0).unwrap(), 2.0);
}

#[tokio::test]
async fn test_split_without_samples_uses_midpoint() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(1)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner
        .split_region(root, &StaticSamples::default())
        .await
        .unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(children[1]).unwrap().bounding_box.low(0).unwrap(), 0.0);
}

#[tokio::test]
async fn test_split_inner_region_rejected() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();

    assert!(matches!(
        partitioner.split_region_at(root, 1.0).await,
        Err(RegionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_split_failed_removes_children() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_failed(root, &children).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.root().state, RegionState::Active);
    assert!(tree.root().is_leaf());
}

#[tokio::test]
async fn test_split_rolled_back_when_placement_fails() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    // The only node already hosts the source, so the high half has no candidate
    let err = partitioner.split_region_at(root, 0.0).await.unwrap_err();
    assert!(err.is_resource_allocation());

    let tree = partitioner
        .context()
        .syncer()
        .wait_for("rollback", Duration::from_secs(5), |tree| {
            tree.len() == 1 && tree.root().state == RegionState::Active
        })
        .await
        .unwrap();
    assert!(tree.root().is_leaf());
}

#[tokio::test]
async fn test_split_tolerates_placement_failure_when_configured() {
    let cluster =
        TestCluster::with_settings(1, settings().with_ignore_allocation_failures(true)).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(
        tree.region(children[0]).unwrap().state,
        RegionState::RedistributionActive
    );
    assert_eq!(tree.region(children[1]).unwrap().state, RegionState::Creating);
    assert!(tree.region(children[1]).unwrap().systems.is_empty());
}

#[tokio::test]
async fn test_split_with_unplaced_child_cannot_complete() {
    let cluster =
        TestCluster::with_settings(1, settings().with_ignore_allocation_failures(true)).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();
    let children = partitioner.split_region_at(root, 0.0).await.unwrap();

    let err = partitioner.split_complete(root, &children).await.unwrap_err();
    assert!(matches!(
        err,
        RegionError::InvalidState { region, actual: RegionState::Creating, .. } if region == children[1]
    ));

    // Nothing moved: the split is still pending
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Splitting);
    assert_eq!(
        tree.region(children[0]).unwrap().state,
        RegionState::RedistributionActive
    );
    assert_eq!(tree.region(children[1]).unwrap().state, RegionState::Creating);

    // The caller can still give up on the split
    partitioner.split_failed(root, &children).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.root().state, RegionState::Active);
}

#[tokio::test]
async fn test_split_rolled_back_on_store_failure() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    cluster.store.fail_writes_matching(
        "child-1/systems",
        1,
        CoordinationError::Unavailable("injected".to_string()),
    );
    assert!(partitioner.split_region_at(root, 0.0).await.is_err());

    let tree = partitioner
        .context()
        .syncer()
        .wait_for("rollback", Duration::from_secs(5), |tree| {
            tree.len() == 1 && tree.root().state == RegionState::Active
        })
        .await
        .unwrap();
    assert!(tree.root().is_leaf());
}

#[tokio::test]
async fn test_split_without_redistribution_activates_immediately() {
    let cluster =
        TestCluster::with_settings(2, settings().with_redistribute_on_split(false)).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    for child in &children {
        assert_eq!(tree.region(*child).unwrap().state, RegionState::Active);
    }
}

// ============================================================================
// Merges
// ============================================================================

#[tokio::test]
async fn test_merge_cycle() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    let candidates = partitioner.merge_candidates(tree.region(children[0]).unwrap());
    assert_eq!(candidates, vec![children.clone()]);

    let destination = partitioner.destination_for_merge(&children).await.unwrap();
    assert_eq!(destination, root);

    partitioner.prepare_merge(&children, destination).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::RedistributionActive);
    for child in &children {
        assert_eq!(tree.region(*child).unwrap().state, RegionState::Merging);
    }

    partitioner.merge_complete(&children, destination).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.root().state, RegionState::Active);
    assert!(tree.root().is_leaf());
}

#[tokio::test]
async fn test_merge_failed_restores_states() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();
    partitioner.prepare_merge(&children, root).await.unwrap();
    partitioner.merge_failed(&children, root).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Split);
    for child in &children {
        assert_eq!(tree.region(*child).unwrap().state, RegionState::Active);
    }
}

#[tokio::test]
async fn test_destination_requires_all_children() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();

    assert!(partitioner.destination_for_merge(&children[..1]).await.is_err());
    assert!(partitioner.destination_for_merge(&[]).await.is_err());
    assert!(partitioner.destination_for_merge(&[root]).await.is_err());
}

#[tokio::test]
async fn test_prepare_merge_twice_is_benign() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();
    partitioner.prepare_merge(&children, root).await.unwrap();

    let err = partitioner.prepare_merge(&children, root).await.unwrap_err();
    assert!(err.is_benign());
}

// ============================================================================
// Full marking, callbacks and local mappings
// ============================================================================

#[tokio::test]
async fn test_set_region_full() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    partitioner.set_region_full(root).await.unwrap();
    partitioner
        .context()
        .syncer()
        .wait_for_state(root, RegionState::ActiveFull, Duration::from_secs(5))
        .await
        .unwrap();

    let err = partitioner.set_region_full(root).await.unwrap_err();
    assert!(err.is_benign());
}

#[tokio::test]
async fn test_callbacks_observe_split() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let (events, callback) = recorder();
    let id = partitioner.register_callback(Arc::new(callback));

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();

    {
        let events = events.lock().unwrap();
        for child in &children {
            assert!(
                events
                    .iter()
                    .any(|e| e.kind == RegionEventKind::Added && e.region.id == *child)
            );
        }
        assert!(events.iter().any(|e| e.kind == RegionEventKind::Changed
            && e.region.id == root
            && e.region.state == RegionState::Splitting));
    }

    assert!(partitioner.unregister_callback(id));
    let seen = events.lock().unwrap().len();
    partitioner.split_complete(root, &children).await.unwrap();
    assert_eq!(events.lock().unwrap().len(), seen);
}

#[tokio::test]
async fn test_local_mappings_follow_split() {
    let cluster = TestCluster::with_settings(2, settings().with_local_node("node-0")).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let mapper = Arc::clone(partitioner.context().mapper());
    let root = partitioner.context().tree().await.unwrap().root_id();
    assert_eq!(mapper.all_region_ids(), BTreeSet::from([root]));

    let children = partitioner.split_region_at(root, 0.0).await.unwrap();
    assert!(!mapper.contains(root));

    partitioner.split_complete(root, &children).await.unwrap();
    mapper
        .wait_until_mapping_appears(children[0], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(mapper.all_region_ids(), BTreeSet::from([children[0]]));
}

#[tokio::test]
async fn test_shutdown_stops_syncer() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    partitioner.shutdown();
    assert!(partitioner.context().syncer().is_closed());
    assert!(matches!(
        partitioner.root_node().await,
        Err(RegionError::Shutdown(_))
    ));
}

#[tokio::test]
async fn test_two_level_split_survives_reload() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster.create_group("points", kdtree_config(2)).await;
    let root = partitioner.context().tree().await.unwrap().root_id();

    let children = partitioner.split_region_at(root, 10.0).await.unwrap();
    partitioner.split_complete(root, &children).await.unwrap();
    let grandchildren = partitioner.split_region_at(children[0], 50.0).await.unwrap();
    partitioner
        .split_complete(children[0], &grandchildren)
        .await
        .unwrap();

    let before = partitioner.context().tree().await.unwrap();
    let left = before.region(children[0]).unwrap();
    assert_eq!(
        left.bounding_box,
        Hyperrectangle::from_pairs(&[(f64::NEG_INFINITY, 10.0), (f64::NEG_INFINITY, f64::INFINITY)])
            .unwrap()
    );
    let right = before.region(children[1]).unwrap();
    assert_eq!(right.bounding_box.low(0).unwrap(), 10.0);
    let lower_left = before.region(grandchildren[0]).unwrap();
    assert_eq!(lower_left.bounding_box.high(0).unwrap(), 10.0);
    assert_eq!(lower_left.bounding_box.high(1).unwrap(), 50.0);
    assert_eq!(lower_left.level, 2);
    assert!(before.partition_violations().is_empty());

    // Ids grow with creation order
    assert!(root < children[0] && children[0] < children[1]);
    assert!(children[1] < grandchildren[0] && grandchildren[0] < grandchildren[1]);

    assert!(cluster.cache.evict("points"));
    let reloaded = cluster.cache.partitioner_for_group("points").await.unwrap();
    let after = reloaded.root_node().await.unwrap().unwrap();
    assert_eq!(*after, *before);
}
