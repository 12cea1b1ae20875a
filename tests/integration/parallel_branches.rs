//! Parallel execution correctness tests.
//!
//! Independent branches run concurrently up to the configured limit, a
//! failure in one branch never touches another, and a task claimed by a
//! competing runner is skipped.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use washmap::core::{CampaignStatus, MapSpec, TaskStatus};
use washmap::orchestration::SchedulerEvent;
use washmap::TaskOutcome;

use crate::fixtures::{
    assert_causal_order, fast_config, labeled_tree, Harness, Hook, ROOT,
};

/// Test: Concurrency limit
/// Given 20 tasks over four independent branches and max_concurrent = 3
/// When the campaign runs with slow transfers
/// Then branches overlap but never more than 3 transfers are in flight
#[tokio::test]
async fn test_concurrency_is_bounded() {
    let h = Harness::new(fast_config(3));
    h.balances.set(ROOT, 1600);
    h.client.set_delay(Duration::from_millis(20));
    let campaign = h.campaign(MapSpec::new("alpha", ROOT, 4, 2), 1600, 0).await;

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.processed, 20);
    assert!(h.client.max_in_flight() <= 3);
    assert!(h.client.max_in_flight() >= 2);
    assert_causal_order(&h.client.calls(), &[ROOT]);
}

/// Test: Partial failure isolation
/// Given transfers to A always fail and no automatic retries
/// When the campaign runs
/// Then A's subtree never leaves unprocessed while B's branch completes
#[tokio::test]
async fn test_failure_isolated_to_branch() {
    let mut config = fast_config(4);
    config.max_retries = 0;
    let h = Harness::new(config);
    h.balances.set(ROOT, 400);
    h.client.fail_to("A", u32::MAX);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.status, CampaignStatus::Processing);

    for task in h.tasks(&campaign.id).await {
        match (task.from_address.as_str(), task.to_address.as_str()) {
            (ROOT, "A") => {
                assert_eq!(task.status, TaskStatus::Failed);
                assert!(!task.is_success);
                assert!(task.error.as_deref().unwrap_or("").contains("rpc rejected"));
            }
            ("A", _) => assert_eq!(task.status, TaskStatus::Unprocessed),
            _ => assert_eq!(task.status, TaskStatus::Processed),
        }
    }
    assert!(h.client.calls().iter().all(|c| c.from != "A"));

    let report = h.service.summary(&campaign.id).await.unwrap();
    assert_eq!(report.blocked, 2);
    assert_eq!(report.exhausted, 1);
    assert_eq!(report.delivered_amount, 200);
}

/// Test: Panicking transfer client
/// Given the signer panics on transfers to B
/// When the campaign runs
/// Then the task is recorded failed and the A branch still completes
#[tokio::test]
async fn test_panic_is_a_task_failure() {
    let mut config = fast_config(4);
    config.max_retries = 0;
    let h = Harness::new(config);
    h.balances.set(ROOT, 400);
    h.client.panic_to("B");
    let campaign = h.campaign(labeled_tree(), 400, 0).await;

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 3);

    let tasks = h.tasks(&campaign.id).await;
    let to_b = tasks.iter().find(|t| t.to_address == "B").unwrap();
    assert_eq!(to_b.status, TaskStatus::Failed);
    assert!(to_b.error.as_deref().unwrap().contains("panicked"));
}

/// Test: Claim conflict
/// Given a competing runner claims the second root task while the first
/// transfer is in flight
/// When the scheduler reaches that task
/// Then it loses the claim, skips the task silently and never sends it
#[tokio::test]
async fn test_lost_claim_is_skipped() {
    let h = Harness::new(fast_config(1));
    h.balances.set(ROOT, 100);
    let campaign = h.campaign(MapSpec::new("alpha", ROOT, 2, 1), 100, 0).await;
    let tasks = h.tasks(&campaign.id).await;
    h.client.on_call(1, Hook::Claim(tasks[1].id));

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(h.client.call_count(), 1);

    let claimed = h.service.list_tasks(&campaign.id).await.unwrap()[1].clone();
    assert_eq!(claimed.status, TaskStatus::Processing);
    assert_eq!(summary.status, CampaignStatus::Processing);
}

/// Test: Outcome recorded while the transfer is in flight
/// Given transfers to A landing at 2 s and to B at 3 s
/// When the operator records A as landed at 1 s
/// Then the run keeps the recorded outcome, still records B, and finishes
#[tokio::test(start_paused = true)]
async fn test_recorded_outcome_mid_flight_keeps_sibling() {
    let h = Harness::new(fast_config(2));
    h.balances.set(ROOT, 100);
    h.client.slow_to("A", Duration::from_secs(2));
    h.client.slow_to("B", Duration::from_secs(3));
    let spec = MapSpec::new("alpha", ROOT, 2, 1)
        .with_addresses(vec!["A".to_string(), "B".to_string()]);
    let campaign = h.campaign(spec, 100, 0).await;
    let to_a = h.tasks(&campaign.id).await[0].clone();
    assert_eq!(to_a.to_address, "A");

    let cancel = CancellationToken::new();
    let (summary, _) = tokio::join!(
        h.service.run(&campaign.id, &cancel),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.service
                .record_outcome(
                    &to_a.id,
                    TaskOutcome::Landed {
                        signature: "sig-operator".to_string(),
                    },
                )
                .await
                .unwrap();
        }
    );
    let summary = summary.unwrap();
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.status, CampaignStatus::Processed);

    let tasks = h.tasks(&campaign.id).await;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Processed));
    assert_eq!(tasks[0].signature.as_deref(), Some("sig-operator"));
    assert!(tasks[1].signature.is_some());
}

/// Test: Lifecycle events
/// Given an event channel on the service
/// When a campaign with one failing branch runs
/// Then started, processed and failed events match the run summary
#[tokio::test]
async fn test_lifecycle_events() {
    let mut config = fast_config(2);
    config.max_retries = 0;
    let h = Harness::new(config);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let service = washmap::CampaignService::new(
        h.store.clone(),
        h.client.clone(),
        h.balances.clone(),
        &washmap::config::Config {
            scheduler: fast_config(2),
            ..Default::default()
        },
    )
    .with_events(tx);
    h.balances.set(ROOT, 100);
    h.client.fail_to("B", u32::MAX);
    let campaign = h.campaign(labeled_tree(), 100, 0).await;

    let summary = service
        .run(&campaign.id, &Default::default())
        .await
        .unwrap();

    let mut started = 0;
    let mut processed = 0;
    let mut failed = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::TaskStarted { campaign_id, .. } => {
                assert_eq!(campaign_id, campaign.id);
                started += 1;
            }
            SchedulerEvent::TaskProcessed { .. } => processed += 1,
            SchedulerEvent::TaskFailed { error, .. } => {
                assert!(error.contains("rpc rejected"));
                failed += 1;
            }
            SchedulerEvent::AllTasksProcessed { .. } => panic!("campaign cannot finish"),
            SchedulerEvent::CampaignPaused { .. } => panic!("campaign was not paused"),
        }
    }
    assert_eq!(started, summary.dispatched);
    assert_eq!(processed, summary.processed);
    assert_eq!(failed, summary.failed);
}
