//! Departures: the ring repairs itself and ownership moves to the next live node

use std::time::Duration;

use chord_integration_tests::integration::{NetworkInvariants, TestHarness};

const CONVERGENCE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_owner_departure_moves_ownership() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 120, 200] {
        harness.add_node(id).await.unwrap();
    }
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();
    assert_eq!(harness.node(10).unwrap().lookup(100).await.unwrap().id, 120);

    harness.remove_node(120).await;

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not repair:\n{}", report);
    }
    assert!(NetworkInvariants::check_departed_references(&harness).is_empty());
    assert!(NetworkInvariants::check_unique_ownership(&harness).is_empty());

    for node in harness.nodes() {
        assert_eq!(node.lookup(100).await.unwrap().id, 200);
    }
    assert!(harness.node(200).unwrap().is_owner(100));

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_shrinks_to_one_node() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 200] {
        harness.add_node(id).await.unwrap();
    }
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();

    harness.remove_node(50).await;
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();
    harness.remove_node(200).await;
    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("last node did not recover:\n{}", report);
    }

    let survivor = harness.node(10).unwrap();
    assert_eq!(survivor.get_successor_list()[0].id, 10);
    assert!(survivor.get_predecessor().is_none());
    assert_eq!(survivor.lookup(100).await.unwrap().id, 10);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejoin_after_departure() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 200] {
        harness.add_node(id).await.unwrap();
    }
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();

    harness.remove_node(50).await;
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();
    harness.add_node(90).await.unwrap();

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not converge after rejoin:\n{}", report);
    }
    assert_eq!(harness.node(10).unwrap().lookup(60).await.unwrap().id, 90);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_owner_is_pruned_and_replaced() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 120, 200] {
        harness.add_node(id).await.unwrap();
    }
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();

    let writer = harness.node(10).unwrap();
    assert_eq!(writer.add_key(150, b"kept".to_vec()).await.unwrap().id, 200);

    harness.crash_node(120).await;

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not repair after a crash:\n{}", report);
    }
    assert!(NetworkInvariants::check_departed_references(&harness).is_empty());
    assert!(NetworkInvariants::check_unique_ownership(&harness).is_empty());

    for node in harness.nodes() {
        assert_eq!(node.lookup(100).await.unwrap().id, 200);
        assert_eq!(node.find_key(150).await.unwrap(), Some(b"kept".to_vec()));
    }
    assert_eq!(harness.node(200).unwrap().get_predecessor().unwrap().id, 50);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_successor_is_skipped_through_successor_list() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 120, 200] {
        harness.add_node(id).await.unwrap();
    }
    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();

    harness.crash_node(50).await;
    harness.crash_node(120).await;

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not repair after two crashes:\n{}", report);
    }
    let first = harness.node(10).unwrap();
    assert_eq!(first.get_successor_list()[0].id, 200);
    assert_eq!(first.lookup(60).await.unwrap().id, 200);

    harness.shutdown().await;
}
