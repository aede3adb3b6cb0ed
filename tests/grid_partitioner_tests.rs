//! Integration tests for the grid and quad-tree partitioners.

mod common;

use std::collections::HashMap;

use common::{TestCluster, grid_config};
use regiontree::distribution::{
    GridLayout, NodeId, PartitionerKind, Region, RegionId, RegionState, RegionTree,
    StaticSamples,
};
use regiontree::hyperrectangle::Hyperrectangle;

const GRID_5X5: &str = "[[0.0,5.0]:[0.0,5.0]];0.5;0.5";
const GRID_4X2: &str = "[[0.0,4.0]:[0.0,2.0]];1.0;1.0";

fn leaf_at(tree: &RegionTree, x: f64, y: f64) -> RegionId {
    tree.leaves()
        .into_iter()
        .find(|leaf| leaf.bounding_box.covers_point(&[x, y]))
        .map(|leaf| leaf.id)
        .expect("a leaf covers the point")
}

fn active_leaves(tree: &RegionTree) -> Vec<&Region> {
    tree.leaves()
        .into_iter()
        .filter(|leaf| leaf.state == RegionState::Active)
        .collect()
}

// ============================================================================
// Static grid
// ============================================================================

#[tokio::test]
async fn test_static_grid_is_flat() {
    let cluster = TestCluster::new(4).await;
    let partitioner = cluster
        .create_group("grid", grid_config("static-grid", GRID_5X5, 2))
        .await;
    assert_eq!(partitioner.kind(), PartitionerKind::StaticGrid);

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Split);
    assert_eq!(tree.children(tree.root_id()).len(), 100);
    assert_eq!(active_leaves(&tree).len(), 100);
    assert!(tree.partition_violations().is_empty());
    assert_eq!(
        tree.root().bounding_box,
        Hyperrectangle::from_pairs(&[(0.0, 5.0), (0.0, 5.0)]).unwrap()
    );
}

#[tokio::test]
async fn test_static_grid_balances_replicas() {
    let cluster = TestCluster::new(4).await;
    let partitioner = cluster
        .create_group("grid", grid_config("static-grid", GRID_5X5, 2))
        .await;

    let tree = partitioner.context().tree().await.unwrap();
    let usage: HashMap<NodeId, u64> = tree.node_usage();
    assert_eq!(usage.len(), 4);
    assert!(usage.values().all(|count| *count == 25));
}

#[tokio::test]
async fn test_static_grid_rejects_structural_changes() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster
        .create_group("grid", grid_config("static-grid", GRID_5X5, 2))
        .await;
    let tree = partitioner.context().tree().await.unwrap();
    let leaf = leaf_at(&tree, 0.1, 0.1);

    let err = partitioner.split_region_at(leaf, 0.2).await.unwrap_err();
    assert!(err.is_unsupported());
    let err = partitioner
        .split_region(leaf, &StaticSamples::default())
        .await
        .unwrap_err();
    assert!(err.is_unsupported());
    assert!(
        partitioner
            .destination_for_merge(&[leaf])
            .await
            .unwrap_err()
            .is_unsupported()
    );

    let region = tree.region(leaf).unwrap();
    assert!(!partitioner.is_splitable(region));
    assert!(!partitioner.is_merging_supported(region));
    assert!(partitioner.merge_candidates(region).is_empty());
}

#[tokio::test]
async fn test_grid_cells_stay_creating_without_nodes() {
    let cluster = TestCluster::new(0).await;
    let partitioner = cluster
        .create_group("grid", grid_config("static-grid", GRID_4X2, 2))
        .await;

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.root().state, RegionState::Split);
    assert_eq!(tree.leaves().len(), 8);
    assert!(
        tree.leaves()
            .iter()
            .all(|leaf| leaf.state == RegionState::Creating)
    );
}

#[tokio::test]
async fn test_last_cell_ends_at_box_edge() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster
        .create_group("uneven", grid_config("static-grid", "[[0.0,1.0]];0.3", 1))
        .await;

    let tree = partitioner.context().tree().await.unwrap();
    let mut leaves = tree.leaves();
    leaves.sort_by(|a, b| a.bounding_box.cmp_by_low(&b.bounding_box));
    assert_eq!(leaves.len(), 4);
    assert_eq!(leaves[3].bounding_box.high(0).unwrap(), 1.0);
    assert!(tree.partition_violations().is_empty());
}

// ============================================================================
// Fixed grid
// ============================================================================

#[tokio::test]
async fn test_fixed_grid_nests_by_dimension() {
    let cluster = TestCluster::new(2).await;
    let partitioner = cluster
        .create_group("grid", grid_config("fixed-grid", GRID_5X5, 2))
        .await;

    let tree = partitioner.context().tree().await.unwrap();
    let slices = tree.children(tree.root_id());
    assert_eq!(slices.len(), 10);
    for slice in &slices {
        assert_eq!(slice.state, RegionState::Split);
        assert_eq!(slice.bounding_box.interval(1).unwrap().low(), 0.0);
        assert_eq!(slice.bounding_box.interval(1).unwrap().high(), 5.0);
        assert_eq!(tree.children(slice.id).len(), 10);
    }
    assert_eq!(active_leaves(&tree).len(), 100);
    assert!(tree.partition_violations().is_empty());
}

// ============================================================================
// Dynamic grid
// ============================================================================

async fn dynamic_grid(cluster: &TestCluster) -> std::sync::Arc<dyn regiontree::distribution::SpacePartitioner> {
    cluster
        .create_group("dynamic", grid_config("dynamic-grid", GRID_4X2, 2))
        .await
}

#[tokio::test]
async fn test_dynamic_grid_leaves_are_siblings_along_first_dimension() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;

    let tree = partitioner.context().tree().await.unwrap();
    let slices = tree.children(tree.root_id());
    assert_eq!(slices.len(), 2);
    for slice in slices {
        let cells = tree.children(slice.id);
        assert_eq!(cells.len(), 4);
        let rows: Vec<f64> = cells
            .iter()
            .map(|cell| cell.bounding_box.low(1).unwrap())
            .collect();
        assert!(rows.iter().all(|row| *row == rows[0]));
    }
    assert_eq!(active_leaves(&tree).len(), 8);
}

#[tokio::test]
async fn test_dynamic_grid_split_replaces_source() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;
    let tree = partitioner.context().tree().await.unwrap();
    let source = leaf_at(&tree, 0.1, 0.1);
    let parent = tree.region(source).unwrap().parent;

    let children = partitioner.split_region_at(source, 0.5).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(source).unwrap().state, RegionState::Splitting);
    for child in &children {
        let region = tree.region(*child).unwrap();
        assert_eq!(region.parent, parent);
        assert_eq!(region.state, RegionState::RedistributionActive);
    }
    assert!(
        tree.region(children[0])
            .unwrap()
            .systems
            .is_disjoint(&tree.region(children[1]).unwrap().systems)
    );

    partitioner.split_complete(source, &children).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert!(!tree.contains(source));
    assert_eq!(active_leaves(&tree).len(), 9);
    assert!(tree.partition_violations().is_empty());
}

#[tokio::test]
async fn test_dynamic_grid_split_failed_keeps_source() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;
    let tree = partitioner.context().tree().await.unwrap();
    let source = leaf_at(&tree, 2.5, 1.5);

    let children = partitioner.split_region_at(source, 2.25).await.unwrap();
    partitioner.split_failed(source, &children).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(source).unwrap().state, RegionState::Active);
    assert!(children.iter().all(|child| !tree.contains(*child)));
    assert_eq!(active_leaves(&tree).len(), 8);
}

#[tokio::test]
async fn test_dynamic_grid_merge_cycle() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;
    let tree = partitioner.context().tree().await.unwrap();
    let source = leaf_at(&tree, 0.1, 0.1);

    let halves = partitioner.split_region_at(source, 0.5).await.unwrap();
    partitioner.split_complete(source, &halves).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    let low = tree.region(halves[0]).unwrap();
    assert!(partitioner.is_merging_supported(low));
    assert_eq!(partitioner.merge_candidates(low), vec![halves.clone()]);
    let high = tree.region(halves[1]).unwrap();
    assert_eq!(partitioner.merge_candidates(high).len(), 2);

    let destination = partitioner.destination_for_merge(&halves).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    let merged = tree.region(destination).unwrap();
    assert_eq!(
        merged.bounding_box,
        Hyperrectangle::from_pairs(&[(0.0, 1.0), (0.0, 1.0)]).unwrap()
    );
    assert_eq!(merged.systems.len(), 1);

    partitioner.prepare_merge(&halves, destination).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(
        tree.region(destination).unwrap().state,
        RegionState::RedistributionActive
    );
    assert!(
        halves
            .iter()
            .all(|h| tree.region(*h).unwrap().state == RegionState::Merging)
    );

    partitioner.merge_complete(&halves, destination).await.unwrap();
    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.region(destination).unwrap().state, RegionState::Active);
    assert!(halves.iter().all(|h| !tree.contains(*h)));
    assert_eq!(active_leaves(&tree).len(), 8);
    assert!(tree.partition_violations().is_empty());
}

#[tokio::test]
async fn test_dynamic_grid_merge_failed_deletes_destination() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;
    let tree = partitioner.context().tree().await.unwrap();
    let sources = vec![leaf_at(&tree, 0.5, 0.5), leaf_at(&tree, 1.5, 0.5)];

    let destination = partitioner.destination_for_merge(&sources).await.unwrap();
    partitioner.prepare_merge(&sources, destination).await.unwrap();
    partitioner.merge_failed(&sources, destination).await.unwrap();

    let tree = partitioner.context().tree().await.unwrap();
    assert!(!tree.contains(destination));
    assert!(
        sources
            .iter()
            .all(|s| tree.region(*s).unwrap().state == RegionState::Active)
    );
    assert!(tree.partition_violations().is_empty());
}

#[tokio::test]
async fn test_dynamic_grid_rejects_non_adjacent_merge() {
    let cluster = TestCluster::new(4).await;
    let partitioner = dynamic_grid(&cluster).await;
    let tree = partitioner.context().tree().await.unwrap();

    let gap = [leaf_at(&tree, 0.5, 0.5), leaf_at(&tree, 2.5, 0.5)];
    assert!(partitioner.destination_for_merge(&gap).await.is_err());

    let other_row = [leaf_at(&tree, 0.5, 0.5), leaf_at(&tree, 0.5, 1.5)];
    assert!(partitioner.destination_for_merge(&other_row).await.is_err());

    let single = [leaf_at(&tree, 0.5, 0.5)];
    assert!(partitioner.destination_for_merge(&single).await.is_err());
}

#[tokio::test]
async fn test_grid_layouts_report_kind() {
    let cluster = TestCluster::new(1).await;
    let partitioner = dynamic_grid(&cluster).await;
    assert_eq!(partitioner.kind(), PartitionerKind::DynamicGrid);
    assert_eq!(partitioner.kind().as_str(), "dynamic-grid");
    assert_ne!(GridLayout::Dynamic, GridLayout::Static);
}

// ============================================================================
// Quad-tree
// ============================================================================

#[tokio::test]
async fn test_quadtree_creates_root_only() {
    let cluster = TestCluster::new(1).await;
    let partitioner = cluster
        .create_group("quad", grid_config("quadtree", "", 2))
        .await;

    let tree = partitioner.context().tree().await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.root().state, RegionState::Active);

    let root = tree.root_id();
    assert!(
        partitioner
            .split_region_at(root, 0.0)
            .await
            .unwrap_err()
            .is_unsupported()
    );
    assert!(
        partitioner
            .split_complete(root, &[])
            .await
            .unwrap_err()
            .is_unsupported()
    );
    assert!(!partitioner.is_splitable(tree.root()));
}
