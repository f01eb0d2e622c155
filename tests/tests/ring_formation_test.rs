//! Ring formation over real loopback connections

use std::time::Duration;

use chord_integration_tests::integration::{NetworkInvariants, TestHarness};

const CONVERGENCE: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_ring() {
    let mut harness = TestHarness::new(8);
    harness.add_node(10).await.unwrap();

    harness.wait_for_stabilization(CONVERGENCE).await.unwrap();
    let node = harness.node(10).unwrap();
    assert_eq!(node.get_successor_list()[0].id, 10);
    assert_eq!(node.lookup(200).await.unwrap().id, 10);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_ring_closes() {
    let mut harness = TestHarness::new(8);
    for id in [10, 50, 200] {
        harness.add_node(id).await.unwrap();
    }

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not converge:\n{}", report);
    }

    for node in harness.nodes() {
        assert_eq!(
            node.get_finger_table()[0].id,
            node.get_successor_list()[0].id
        );
        assert_eq!(node.lookup(60).await.unwrap().id, 200);
        assert_eq!(node.lookup(5).await.unwrap().id, 10);
        assert_eq!(node.lookup(201).await.unwrap().id, 10);
        assert_eq!(node.lookup(50).await.unwrap().id, 50);
    }

    let ring: Vec<u64> = harness
        .nodes()
        .iter()
        .map(|node| node.get_successor_list()[0].id)
        .collect();
    assert_eq!(ring, vec![50, 200, 10]);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joins_in_any_order_converge() {
    let mut harness = TestHarness::new(8);
    for id in [128, 3, 250, 64, 100, 17] {
        harness.add_node(id).await.unwrap();
    }

    if let Err(report) = harness.wait_for_stabilization(CONVERGENCE).await {
        panic!("ring did not converge:\n{}", report);
    }
    assert!(NetworkInvariants::check_unique_ownership(&harness).is_empty());

    for node in harness.nodes() {
        for key in [0, 3, 4, 99, 100, 129, 251, 255] {
            let expected = harness.expected_owner(key).unwrap();
            assert_eq!(node.lookup(key).await.unwrap().id, expected);
        }
    }

    harness.shutdown().await;
}
