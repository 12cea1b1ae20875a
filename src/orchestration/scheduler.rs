//! Scheduler for concurrent transfer execution.
//!
//! The Scheduler drives one campaign run: it verifies the source balance,
//! requeues failed tasks that still have retries, then dispatches ready
//! tasks to the worker pool while respecting dependencies and the
//! concurrency limit. Disabling the campaign or cancelling the run stops
//! new dispatches; transfers already in flight finish and are recorded.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::{CampaignId, CampaignStatus, Task, TaskCampaign, TaskDAG, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::aggregator::StatusAggregator;
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::transfer::{BalanceQuery, TransferClient, TransferRequest};
use crate::state::Store;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components to react to task state changes
/// without polling the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task was claimed and its transfer dispatched.
    TaskStarted {
        /// The campaign the task belongs to.
        campaign_id: CampaignId,
        /// The task that was started.
        task_id: TaskId,
    },
    /// A transfer landed.
    TaskProcessed {
        /// The task that was processed.
        task_id: TaskId,
        /// Signature returned by the transfer client.
        signature: String,
    },
    /// A transfer failed or timed out.
    TaskFailed {
        /// The task that failed.
        task_id: TaskId,
        /// Error message describing the failure.
        error: String,
    },
    /// The campaign was disabled mid-run; dispatching stopped.
    CampaignPaused {
        /// The paused campaign.
        campaign_id: CampaignId,
    },
    /// Every task in the campaign is processed.
    AllTasksProcessed {
        /// The finished campaign.
        campaign_id: CampaignId,
    },
}

/// What one scheduler run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub campaign_id: CampaignId,
    /// Transfers handed to workers.
    pub dispatched: usize,
    pub processed: usize,
    pub failed: usize,
    /// Failed tasks put back in the queue at the start of the run.
    pub requeued: usize,
    /// Claims lost to another runner.
    pub conflicts: usize,
    /// Tasks found in flight from an earlier run.
    pub stuck: usize,
    /// The campaign was disabled while running.
    pub paused: bool,
    pub cancelled: bool,
    /// Campaign status after the run.
    pub status: CampaignStatus,
}

impl RunSummary {
    fn new(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id,
            dispatched: 0,
            processed: 0,
            failed: 0,
            requeued: 0,
            conflicts: 0,
            stuck: 0,
            paused: false,
            cancelled: false,
            status: CampaignStatus::Unprocessed,
        }
    }
}

/// Scheduler for campaign execution.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use washmap::orchestration::{Scheduler, SimulatedLedger};
///
/// let ledger = Arc::new(SimulatedLedger::new());
/// let scheduler = Scheduler::new(store, ledger.clone(), ledger, SchedulerConfig::default());
/// let summary = scheduler.run(&campaign_id, &CancellationToken::new()).await?;
/// ```
pub struct Scheduler {
    store: Arc<dyn Store>,
    client: Arc<dyn TransferClient>,
    balances: Arc<dyn BalanceQuery>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    aggregator: StatusAggregator,
    /// Optional channel for lifecycle events.
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `store` - Persistence for campaigns and tasks
    /// * `client` - Executes transfers
    /// * `balances` - Answers the pre-run balance check
    /// * `config` - Concurrency, timeout and retry limits
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn TransferClient>,
        balances: Arc<dyn BalanceQuery>,
        config: SchedulerConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        Self {
            aggregator: StatusAggregator::new(store.clone(), retry),
            store,
            client,
            balances,
            config,
            retry,
            event_tx: None,
        }
    }

    /// Emit lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Verify the source side can cover the campaign.
    ///
    /// Distribution needs the root to hold the campaign total plus the
    /// whole gas budget. Collection needs every leaf to hold its outbound
    /// amount plus its gas.
    pub async fn check_source_balance(
        &self,
        campaign: &TaskCampaign,
        tasks: &[Task],
    ) -> Result<()> {
        let overflow = || Error::AmountPolicy("required balance overflows".to_string());
        let sources: Vec<(String, u128)> = if campaign.reverse {
            tasks
                .iter()
                .filter(|t| t.depends_on.is_empty())
                .map(|t| {
                    t.amount
                        .checked_add(t.gas)
                        .map(|required| (t.from_address.clone(), required))
                        .ok_or_else(overflow)
                })
                .collect::<Result<_>>()?
        } else {
            let map = self.store.get_map(&campaign.map_id).await?;
            let required = campaign
                .total_amount
                .checked_add(campaign.gas_budget)
                .ok_or_else(overflow)?;
            vec![(map.root_address, required)]
        };

        for (address, required) in sources {
            let available = self
                .balances
                .balance_of(&address, &campaign.token)
                .await
                .map_err(|e| Error::Balance(e.0))?;
            if available < required {
                warn!(
                    campaign = %campaign.id,
                    address = %address,
                    required,
                    available,
                    "source balance too low"
                );
                return Err(Error::InsufficientRootBalance {
                    address,
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Run the campaign until no task can make progress.
    ///
    /// The loop:
    /// 1. Requeues failed tasks that still have retries
    /// 2. Checks the source balance once per campaign
    /// 3. Dispatches ready tasks up to the concurrency limit, holding a
    ///    requeued task back until its backoff has elapsed
    /// 4. Records each worker outcome as it arrives
    /// 5. Stops dispatching when the campaign is disabled or `cancel` fires,
    ///    and returns once in-flight transfers have drained
    ///
    /// An error met mid-run also stops dispatching. The run still waits
    /// for every in-flight transfer and records its outcome before
    /// returning the first error.
    ///
    /// # Errors
    ///
    /// - `Error::CampaignDisabled` if the campaign is not enabled
    /// - `Error::InsufficientRootBalance` if the balance check fails; no
    ///   transfer is made and the campaign stays `unprocessed`
    /// - `Error::InvalidTransition` if the campaign is marked failed
    pub async fn run(
        &self,
        campaign_id: &CampaignId,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        if !campaign.enabled {
            return Err(Error::CampaignDisabled(*campaign_id));
        }
        if campaign.status == CampaignStatus::Failed {
            return Err(Error::InvalidTransition {
                from: CampaignStatus::Failed.to_string(),
                to: CampaignStatus::Processing.to_string(),
            });
        }

        let mut summary = RunSummary::new(*campaign_id);
        let mut tasks = self.store.list_tasks(campaign_id).await?;
        let mut not_before = self.requeue_failed(&mut tasks, &mut summary).await?;

        for task in tasks.iter().filter(|t| t.status == TaskStatus::Processing) {
            warn!(
                campaign = %campaign_id,
                task = %task.id,
                "task left in flight by an earlier run; record its outcome to continue its branch"
            );
            summary.stuck += 1;
        }

        let pending = tasks.iter().any(|t| t.status == TaskStatus::Unprocessed);
        if pending && !campaign.root_has_enough_token {
            self.check_source_balance(&campaign, &tasks).await?;
            self.store.mark_source_funded(campaign_id).await?;
            info!(campaign = %campaign_id, "source balance verified");
        }
        if pending && campaign.status == CampaignStatus::Unprocessed {
            self.store
                .update_campaign_status(campaign_id, CampaignStatus::Processing)
                .await?;
        }

        let mut dag = TaskDAG::from_tasks(tasks)?;
        let max_concurrent = self.config.max_concurrent.max(1);
        let (tx, mut rx) = mpsc::channel(max_concurrent);
        let mut pool = WorkerPool::new(max_concurrent, self.config.transfer_timeout(), tx);
        let mut stopping = false;
        let mut first_error: Option<Error> = None;

        info!(
            campaign = %campaign_id,
            tasks = dag.task_count(),
            max_concurrent,
            "campaign run started"
        );

        loop {
            if !stopping {
                if cancel.is_cancelled() {
                    stopping = true;
                    summary.cancelled = true;
                    info!(campaign = %campaign_id, in_flight = pool.active_count(), "run cancelled");
                } else {
                    match self.store.get_campaign(campaign_id).await {
                        Ok(current) if !current.enabled => {
                            stopping = true;
                            summary.paused = true;
                            info!(campaign = %campaign_id, in_flight = pool.active_count(), "campaign paused");
                            self.emit(SchedulerEvent::CampaignPaused {
                                campaign_id: *campaign_id,
                            });
                        }
                        Ok(_) => {}
                        Err(e) => halt(campaign_id, &pool, &mut stopping, &mut first_error, e),
                    }
                }
            }

            if !stopping {
                if let Err(e) = self
                    .dispatch_ready(&mut dag, &mut pool, &mut not_before, &mut summary)
                    .await
                {
                    halt(campaign_id, &pool, &mut stopping, &mut first_error, e);
                }
            }

            // A full pool wakes on the next worker event instead.
            let wake = if stopping || !pool.has_capacity() {
                None
            } else {
                next_retry(&dag, &pool, &not_before)
            };
            if pool.active_count() == 0 && wake.is_none() {
                break;
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event, &mut dag, &mut pool, &mut summary).await {
                            halt(campaign_id, &pool, &mut stopping, &mut first_error, e);
                        }
                    }
                    None => break,
                },
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    summary.cancelled = true;
                    info!(campaign = %campaign_id, in_flight = pool.active_count(), "run cancelled");
                }
            }
        }

        if let Some(e) = first_error {
            if let Err(refresh) = self.aggregator.refresh(campaign_id).await {
                warn!(campaign = %campaign_id, error = %refresh, "status refresh failed");
            }
            error!(
                campaign = %campaign_id,
                dispatched = summary.dispatched,
                processed = summary.processed,
                failed = summary.failed,
                error = %e,
                "campaign run aborted"
            );
            return Err(e);
        }

        summary.status = self.aggregator.refresh(campaign_id).await?;
        if summary.status == CampaignStatus::Processed {
            info!(campaign = %campaign_id, "all tasks processed");
            self.emit(SchedulerEvent::AllTasksProcessed {
                campaign_id: *campaign_id,
            });
        }
        info!(
            campaign = %campaign_id,
            dispatched = summary.dispatched,
            processed = summary.processed,
            failed = summary.failed,
            status = %summary.status,
            "campaign run finished"
        );
        Ok(summary)
    }

    /// Requeue failed tasks with retries left. Returns the instant before
    /// which each requeued task must not be claimed.
    async fn requeue_failed(
        &self,
        tasks: &mut [Task],
        summary: &mut RunSummary,
    ) -> Result<HashMap<TaskId, Instant>> {
        let now = Instant::now();
        let mut not_before = HashMap::new();
        for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Failed) {
            if !self.retry.should_retry(task) {
                warn!(
                    task = %task.id,
                    attempts = task.attempts,
                    "retries exhausted; retry the task explicitly"
                );
                continue;
            }
            task.requeue()?;
            self.store.update_task(task).await?;

            let retry = self.retry.retries_used(task) + 1;
            let delay = self.retry.backoff_for(retry);
            debug!(task = %task.id, retry, delay_ms = delay.as_millis() as u64, "task requeued");
            not_before.insert(task.id, now + delay);
            summary.requeued += 1;
        }
        Ok(not_before)
    }

    /// Claim and dispatch ready tasks while the pool has room.
    ///
    /// A requeued task stays unclaimed until its backoff has elapsed.
    async fn dispatch_ready(
        &self,
        dag: &mut TaskDAG,
        pool: &mut WorkerPool,
        not_before: &mut HashMap<TaskId, Instant>,
        summary: &mut RunSummary,
    ) -> Result<usize> {
        let now = Instant::now();
        let ready: Vec<TaskId> = dag
            .ready_tasks(pool.active())
            .into_iter()
            .map(|t| t.id)
            .filter(|id| not_before.get(id).map_or(true, |at| *at <= now))
            .collect();
        let mut dispatched = 0;

        for task_id in ready {
            if !pool.has_capacity() {
                break;
            }
            not_before.remove(&task_id);

            if !self.store.claim_task(&task_id).await? {
                // Another runner owns it; pick up its current state.
                debug!(task = %task_id, "claim lost, skipping");
                summary.conflicts += 1;
                let current = self.store.get_task(&task_id).await?;
                dag.update_task(current)?;
                continue;
            }

            let claimed = self.store.get_task(&task_id).await?;
            pool.spawn(task_id, TransferRequest::from(&claimed), self.client.clone())?;
            debug!(
                task = %task_id,
                sort_id = claimed.sort_id,
                from = %claimed.from_address,
                to = %claimed.to_address,
                amount = %claimed.amount,
                "transfer dispatched"
            );
            self.emit(SchedulerEvent::TaskStarted {
                campaign_id: claimed.campaign_id,
                task_id,
            });
            dag.update_task(claimed)?;
            summary.dispatched += 1;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Record a worker outcome.
    ///
    /// If the task already left `processing` (an operator recorded its
    /// outcome while the transfer was in flight), the stored outcome is
    /// kept and the worker's is only logged.
    async fn handle_event(
        &self,
        event: WorkerEvent,
        dag: &mut TaskDAG,
        pool: &mut WorkerPool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let task_id = event.task_id();
        if !pool.finish(&task_id) {
            return Ok(());
        }

        let mut task = self.store.get_task(&task_id).await?;
        if task.status != TaskStatus::Processing {
            warn!(
                task = %task_id,
                status = %task.status,
                outcome = ?event,
                "outcome already recorded; keeping the stored one"
            );
            return dag.update_task(task);
        }

        match event {
            WorkerEvent::Landed { signature, .. } => {
                task.complete(&signature)?;
                self.store.update_task(&task).await?;
                info!(task = %task_id, signature = %signature, "transfer landed");
                summary.processed += 1;
                self.emit(SchedulerEvent::TaskProcessed { task_id, signature });
            }
            WorkerEvent::Failed { error, .. } => {
                task.fail(&error)?;
                self.store.update_task(&task).await?;
                warn!(task = %task_id, error = %error, "transfer failed");
                summary.failed += 1;
                self.emit(SchedulerEvent::TaskFailed { task_id, error });
            }
        }
        dag.update_task(task)
    }
}

/// Stop dispatching and keep the first error for when the run drains.
fn halt(
    campaign_id: &CampaignId,
    pool: &WorkerPool,
    stopping: &mut bool,
    first_error: &mut Option<Error>,
    e: Error,
) {
    error!(
        campaign = %campaign_id,
        in_flight = pool.active_count(),
        error = %e,
        "run halted; draining in-flight transfers"
    );
    *stopping = true;
    if first_error.is_none() {
        *first_error = Some(e);
    }
}

/// Earliest instant a ready task held back by its backoff may be claimed.
fn next_retry(
    dag: &TaskDAG,
    pool: &WorkerPool,
    not_before: &HashMap<TaskId, Instant>,
) -> Option<Instant> {
    dag.ready_tasks(pool.active())
        .into_iter()
        .filter_map(|t| not_before.get(&t.id).copied())
        .min()
}
