//! Pause, resume and recovery integration tests.
//!
//! These tests verify that a campaign can be stopped and continued without
//! repeating landed transfers, that failures are retried within budget,
//! and that state survives a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use washmap::core::{CampaignStatus, MapSpec, TaskStatus};
use washmap::state::{MemoryStore, Store};
use washmap::TaskOutcome;

use crate::fixtures::{fast_config, labeled_tree, Harness, Hook, ROOT};

/// Test: Pause and resume
/// Given a campaign disabled while its second transfer is in flight
/// When it is re-enabled and run again
/// Then exactly the remaining 4 tasks are executed
#[tokio::test]
async fn test_disable_then_reenable_runs_remaining_four() {
    let h = Harness::new(fast_config(1));
    h.balances.set(ROOT, 400);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;
    h.client.on_call(2, Hook::Disable(campaign.id));

    let first = h.run(&campaign.id).await;
    assert!(first.paused);
    assert_eq!(first.processed, 2);
    assert_eq!(first.status, CampaignStatus::Processing);

    let stored = h.service.get_campaign(&campaign.id).await.unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.status, CampaignStatus::Processing);

    h.service.enable(&campaign.id).await.unwrap();
    let second = h.run(&campaign.id).await;
    assert_eq!(second.dispatched, 4);
    assert_eq!(second.processed, 4);
    assert_eq!(second.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 6);
}

/// Test: Disabled campaigns do not run
/// Given a campaign the operator disabled
/// When the scheduler is asked to run it
/// Then it refuses and nothing is sent
#[tokio::test]
async fn test_disabled_campaign_is_refused() {
    let h = Harness::new(fast_config(2));
    h.balances.set(ROOT, 400);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;
    h.service.disable(&campaign.id).await.unwrap();

    let err = h
        .service
        .run(&campaign.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, washmap::Error::CampaignDisabled(id) if id == campaign.id));
    assert_eq!(h.client.call_count(), 0);
}

/// Test: Cancellation drains in-flight transfers
/// Given both root transfers in flight when the run is cancelled
/// When the scheduler stops
/// Then both are recorded and no leaf transfer starts
#[tokio::test]
async fn test_cancel_drains_in_flight() {
    let h = Harness::new(fast_config(2));
    h.balances.set(ROOT, 400);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;
    let cancel = CancellationToken::new();
    h.client.on_call(1, Hook::Cancel(cancel.clone()));

    let summary = h.service.run(&campaign.id, &cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 2);
    assert_eq!(h.client.call_count(), 2);

    let pending = h
        .tasks(&campaign.id)
        .await
        .into_iter()
        .filter(|t| t.status == TaskStatus::Unprocessed)
        .count();
    assert_eq!(pending, 4);
}

/// Test: Automatic retry
/// Given the transfer to A fails once
/// When the scheduler runs twice
/// Then the second run requeues it, the branch completes, and landed
/// transfers are not repeated
#[tokio::test]
async fn test_failed_task_retried_on_rerun() {
    let h = Harness::new(fast_config(4));
    h.balances.set(ROOT, 400);
    h.client.fail_to("A", 1);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;

    let first = h.run(&campaign.id).await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.processed, 3);

    let second = h.run(&campaign.id).await;
    assert_eq!(second.requeued, 1);
    assert_eq!(second.processed, 3);
    assert_eq!(second.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 7);

    let to_a = h
        .tasks(&campaign.id)
        .await
        .into_iter()
        .find(|t| t.to_address == "A")
        .unwrap();
    assert_eq!(to_a.attempts, 2);
    assert!(to_a.is_success);
}

/// Test: Retry budget
/// Given the transfer to A always fails and one automatic retry
/// When the retry is spent and the operator disables the campaign
/// Then the campaign is marked failed until it is resumed
#[tokio::test]
async fn test_exhausted_retries_mark_campaign_failed() {
    let mut config = fast_config(4);
    config.max_retries = 1;
    let h = Harness::new(config);
    h.balances.set(ROOT, 400);
    h.client.fail_to("A", u32::MAX);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;

    h.run(&campaign.id).await;
    let retried = h.run(&campaign.id).await;
    assert_eq!(retried.requeued, 1);
    assert_eq!(retried.failed, 1);

    let spent = h.run(&campaign.id).await;
    assert_eq!(spent.requeued, 0);
    assert_eq!(spent.dispatched, 0);
    assert_eq!(spent.status, CampaignStatus::Processing);

    assert!(h.service.disable(&campaign.id).await.unwrap());
    assert_eq!(
        h.service.status(&campaign.id).await.unwrap(),
        CampaignStatus::Failed
    );

    h.service.enable(&campaign.id).await.unwrap();
    let err = h
        .service
        .run(&campaign.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, washmap::Error::InvalidTransition { .. }));

    h.client.heal("A");
    let resumed = h
        .service
        .resume(&campaign.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.processed, 3);
    assert_eq!(resumed.status, CampaignStatus::Processed);
}

/// Test: Pause during a retry backoff
/// Given a failed transfer requeued with a 10 s backoff
/// When the operator disables the campaign 1 s into the wait
/// Then the retry is never sent, the task stays unprocessed, and the next
/// run sends it once
#[tokio::test(start_paused = true)]
async fn test_pause_during_backoff_withholds_retry() {
    let mut config = fast_config(1);
    config.retry_backoff_ms = 10_000;
    let h = Harness::new(config);
    h.balances.set(ROOT, 100);
    h.client.fail_to("A", 1);
    let spec = MapSpec::new("alpha", ROOT, 1, 1).with_addresses(vec!["A".to_string()]);
    let campaign = h.campaign(spec, 100, 0).await;

    let first = h.run(&campaign.id).await;
    assert_eq!(first.failed, 1);

    let (second, _) = tokio::join!(h.run(&campaign.id), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.service.disable(&campaign.id).await.unwrap();
    });
    assert!(second.paused);
    assert_eq!(second.requeued, 1);
    assert_eq!(second.dispatched, 0);
    assert_eq!(h.client.call_count(), 1);
    assert_eq!(h.tasks(&campaign.id).await[0].status, TaskStatus::Unprocessed);

    h.service.enable(&campaign.id).await.unwrap();
    let third = h.run(&campaign.id).await;
    assert_eq!(third.processed, 1);
    assert_eq!(third.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 2);
}

/// Test: Transfer timeout
/// Given a transfer to B that takes longer than the timeout
/// When the campaign runs
/// Then the task fails with a timeout and its branch stays blocked
#[tokio::test(start_paused = true)]
async fn test_timeout_is_a_task_failure() {
    let mut config = fast_config(4);
    config.transfer_timeout_secs = 1;
    config.max_retries = 0;
    let h = Harness::new(config);
    h.balances.set(ROOT, 400);
    h.client.slow_to("B", Duration::from_secs(30));
    let campaign = h.campaign(labeled_tree(), 400, 0).await;

    let summary = h.run(&campaign.id).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 3);

    let to_b = h
        .tasks(&campaign.id)
        .await
        .into_iter()
        .find(|t| t.to_address == "B")
        .unwrap();
    assert_eq!(to_b.status, TaskStatus::Failed);
    assert!(to_b.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(h.service.summary(&campaign.id).await.unwrap().blocked, 2);
}

/// Test: Crash recovery
/// Given a task left processing by a crashed run
/// When the scheduler runs
/// Then the task is reported stuck and its children wait until the
/// operator records the outcome
#[tokio::test]
async fn test_stuck_task_waits_for_recorded_outcome() {
    let h = Harness::new(fast_config(4));
    h.balances.set(ROOT, 400);
    let campaign = h.campaign(labeled_tree(), 400, 0).await;
    let to_a = h.tasks(&campaign.id).await[0].clone();
    assert_eq!(to_a.to_address, "A");

    // A crashed runner claimed the task and never wrote an outcome.
    assert!(h.store.claim_task(&to_a.id).await.unwrap());

    let first = h.run(&campaign.id).await;
    assert_eq!(first.stuck, 1);
    assert_eq!(first.processed, 3);
    assert!(h.client.calls().iter().all(|c| c.to != "A" && c.from != "A"));

    h.service
        .record_outcome(
            &to_a.id,
            TaskOutcome::Landed {
                signature: "sig-recovered".to_string(),
            },
        )
        .await
        .unwrap();
    let second = h.run(&campaign.id).await;
    assert_eq!(second.processed, 2);
    assert_eq!(second.status, CampaignStatus::Processed);
}

/// Test: Restart from the state file
/// Given a campaign paused after 2 transfers and a store backed by a file
/// When the store is reopened in a fresh service
/// Then the processed tasks are remembered and only the rest are sent
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let campaign_id = {
        let store = Arc::new(MemoryStore::open(&path).await.unwrap());
        let h = Harness::with_store(store, fast_config(1));
        h.balances.set(ROOT, 400);
        let campaign = h.campaign(labeled_tree(), 400, 0).await;
        h.client.on_call(2, Hook::Disable(campaign.id));
        let summary = h.run(&campaign.id).await;
        assert_eq!(summary.processed, 2);
        campaign.id
    };

    let store = Arc::new(MemoryStore::open(&path).await.unwrap());
    let h = Harness::with_store(store, fast_config(1));
    let campaign = h.service.get_campaign(&campaign_id).await.unwrap();
    assert!(!campaign.enabled);
    assert!(campaign.root_has_enough_token);

    let processed = h
        .tasks(&campaign_id)
        .await
        .iter()
        .filter(|t| t.status == TaskStatus::Processed)
        .count();
    assert_eq!(processed, 2);

    // The gate already passed before the restart; no balance is needed.
    h.service.enable(&campaign_id).await.unwrap();
    let summary = h.run(&campaign_id).await;
    assert_eq!(summary.dispatched, 4);
    assert_eq!(summary.status, CampaignStatus::Processed);
    assert_eq!(h.client.call_count(), 4);
}
