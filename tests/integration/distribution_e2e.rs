//! End-to-end distribution and collection tests.
//!
//! These tests build a map, plan a campaign and run it through the
//! service, checking amounts, ordering and the balance gate.

use std::collections::HashMap;

use washmap::core::{CampaignStatus, MapSpec, SplitPolicy, TaskStatus};
use washmap::planning::PlanRequest;
use washmap::state::Store;
use washmap::Error;

use crate::fixtures::{assert_causal_order, fast_config, labeled_tree, Harness, ROOT, TOKEN};

/// Test: Binary tree of depth 2 with 10 000 units
/// Given an equal-leaf plan over b=2, d=2
/// When the campaign runs
/// Then root edges carry 5000, leaf edges 2500, and all 6 tasks land in order
#[tokio::test]
async fn test_two_by_two_distribution() {
    let h = Harness::new(fast_config(4));
    h.balances.set(ROOT, 10_000);
    let campaign = h.campaign(labeled_tree(), 10_000, 0).await;

    let tasks = h.tasks(&campaign.id).await;
    assert_eq!(tasks.len(), 6);
    for task in &tasks[..2] {
        assert_eq!(task.from_address, ROOT);
        assert_eq!(task.amount, 5000);
        assert!(task.depends_on.is_empty());
    }
    for task in &tasks[2..] {
        assert_eq!(task.amount, 2500);
        assert_eq!(task.depends_on.len(), 1);
    }
    let sort_ids: Vec<u32> = tasks.iter().map(|t| t.sort_id).collect();
    assert_eq!(sort_ids, vec![0, 1, 2, 3, 4, 5]);

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.dispatched, 6);
    assert_eq!(summary.processed, 6);
    assert_eq!(summary.status, CampaignStatus::Processed);

    assert_causal_order(&h.client.calls(), &[ROOT]);
    for task in h.tasks(&campaign.id).await {
        assert_eq!(task.status, TaskStatus::Processed);
        assert!(task.is_success);
        assert!(task.signature.is_some());
    }

    let report = h.service.summary(&campaign.id).await.unwrap();
    assert_eq!(report.delivered_amount, 10_000);
    assert!(report.is_complete());
}

/// Test: Idempotent re-run
/// Given a fully processed campaign
/// When the scheduler runs again
/// Then no transfer is made and the status stays processed
#[tokio::test]
async fn test_rerun_processed_campaign_is_noop() {
    let h = Harness::new(fast_config(4));
    h.balances.set(ROOT, 10_000);
    let campaign = h.campaign(labeled_tree(), 10_000, 0).await;
    h.run(&campaign.id).await;
    assert_eq!(h.client.call_count(), 6);

    let again = h.run(&campaign.id).await;
    assert_eq!(again.dispatched, 0);
    assert_eq!(again.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 6);
}

/// Test: Balance gate
/// Given a root holding 100 while the campaign needs 100 + 2 x 25 gas
/// When the campaign runs
/// Then it fails with InsufficientRootBalance, stays unprocessed, and
/// nothing is sent; after funding it runs normally
#[tokio::test]
async fn test_insufficient_root_balance() {
    let h = Harness::new(fast_config(4));
    h.balances.set(ROOT, 100);
    let campaign = h.campaign(MapSpec::new("alpha", ROOT, 2, 1), 100, 25).await;
    assert_eq!(campaign.gas_budget, 50);

    let err = h
        .service
        .run(&campaign.id, &Default::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    match err {
        Error::InsufficientRootBalance {
            address,
            required,
            available,
        } => {
            assert_eq!(address, ROOT);
            assert_eq!(required, 150);
            assert_eq!(available, 100);
        }
        other => panic!("unexpected error: {}", other),
    }

    let stored = h.service.get_campaign(&campaign.id).await.unwrap();
    assert_eq!(stored.status, CampaignStatus::Unprocessed);
    assert!(!stored.root_has_enough_token);
    assert_eq!(h.client.call_count(), 0);

    h.balances.set(ROOT, 150);
    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 2);
}

/// Test: Collection pass
/// Given a reversed binary tree with 100 units at each leaf
/// When the campaign runs
/// Then leaves send first and each intermediate forwards only after both
/// of its children arrived
#[tokio::test]
async fn test_collection_run() {
    let h = Harness::new(fast_config(4));
    for leaf in ["A1", "A2", "B1", "B2"] {
        h.balances.set(leaf, 100);
    }
    let campaign = h.campaign(labeled_tree().reversed(), 400, 0).await;
    assert!(campaign.reverse);
    assert_eq!(campaign.total_amount, 400);

    let tasks = h.tasks(&campaign.id).await;
    let froms: Vec<&str> = tasks.iter().map(|t| t.from_address.as_str()).collect();
    assert_eq!(froms, vec!["A1", "A2", "B1", "B2", "A", "B"]);
    assert_eq!(tasks[4].amount, 200);
    assert_eq!(tasks[4].to_address, ROOT);
    assert_eq!(tasks[4].depends_on.len(), 2);

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.processed, 6);

    let calls = h.client.calls();
    let position: HashMap<(String, String), usize> = calls
        .iter()
        .enumerate()
        .map(|(i, c)| ((c.from.clone(), c.to.clone()), i))
        .collect();
    let at = |from: &str, to: &str| position[&(from.to_string(), to.to_string())];
    assert!(at("A", ROOT) > at("A1", "A"));
    assert!(at("A", ROOT) > at("A2", "A"));
    assert!(at("B", ROOT) > at("B1", "B"));
    assert!(at("B", ROOT) > at("B2", "B"));
}

/// Test: Collection gate checks every leaf
/// Given one leaf short of its amount
/// When the campaign runs
/// Then the gate names that leaf and nothing is sent
#[tokio::test]
async fn test_collection_gate_names_short_leaf() {
    let h = Harness::new(fast_config(4));
    for leaf in ["A1", "A2", "B1"] {
        h.balances.set(leaf, 100);
    }
    h.balances.set("B2", 99);
    let campaign = h.campaign(labeled_tree().reversed(), 400, 0).await;

    let err = h
        .service
        .run(&campaign.id, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientRootBalance { ref address, required: 100, available: 99 } if address == "B2"
    ));
    assert_eq!(h.client.call_count(), 0);
}

/// Test: Equal-fanout split
/// Given b=3, d=2 and 100 units split per node
/// When planned
/// Then root edges carry 33, leaf edges 11, and 1 unit stays at the root
#[tokio::test]
async fn test_equal_fanout_plan() {
    let h = Harness::new(fast_config(4));
    let campaign = h
        .campaign_with(
            MapSpec::new("alpha", ROOT, 3, 2),
            PlanRequest::new(TOKEN, 0, 100, 0).with_policy(SplitPolicy::EqualFanout),
        )
        .await;
    assert_eq!(campaign.split_policy, SplitPolicy::EqualFanout);
    assert_eq!(campaign.total_amount, 99);
    assert_eq!(campaign.dust(), 1);

    let tasks = h.tasks(&campaign.id).await;
    assert!(tasks[..3].iter().all(|t| t.amount == 33));
    assert!(tasks[3..].iter().all(|t| t.amount == 11));
}

/// Test: Equal-leaf rounding
/// Given 10 units over 3 leaves
/// When planned
/// Then each leaf gets 3 and the remainder is below the leaf count
#[tokio::test]
async fn test_equal_leaf_rounding() {
    let h = Harness::new(fast_config(4));
    let campaign = h.campaign(MapSpec::new("alpha", ROOT, 3, 1), 10, 0).await;
    assert_eq!(campaign.leaf_amount, 3);
    assert_eq!(campaign.total_amount, 9);
    assert!(campaign.dust() < campaign.leaf_count as u128);
}

/// Test: Built graph shape
/// Given b=3, d=3
/// When built and planned
/// Then there are 40 nodes, every non-root node has one parent one level
/// up, and one task per edge with dependencies earlier in sort order
#[tokio::test]
async fn test_built_graph_and_plan_shape() {
    let h = Harness::new(fast_config(4));
    let campaign = h.campaign(MapSpec::new("alpha", ROOT, 3, 3), 27_000, 0).await;

    let nodes = h.service.list_nodes(&campaign.map_id).await.unwrap();
    let edges = h.store.list_edges(&campaign.map_id).await.unwrap();
    assert_eq!(nodes.len(), 40);
    assert_eq!(edges.len(), 39);

    let depth: HashMap<_, _> = nodes.iter().map(|n| (n.id, n.depth_id)).collect();
    let mut in_degree: HashMap<_, usize> = HashMap::new();
    for edge in &edges {
        *in_degree.entry(edge.to_node).or_default() += 1;
        assert_eq!(depth[&edge.to_node], depth[&edge.from_node] + 1);
    }
    for node in &nodes {
        let expected = if node.depth_id == 0 { 0 } else { 1 };
        assert_eq!(in_degree.get(&node.id).copied().unwrap_or(0), expected);
    }

    let tasks = h.tasks(&campaign.id).await;
    assert_eq!(tasks.len(), edges.len());
    let sort: HashMap<_, _> = tasks.iter().map(|t| (t.id, t.sort_id)).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            assert!(sort[dep] < task.sort_id);
        }
    }
    assert!(tasks[12..].iter().all(|t| t.amount == 1000));
}
