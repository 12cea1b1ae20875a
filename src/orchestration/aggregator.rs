//! Campaign status aggregation.
//!
//! The campaign status is a pure function of its tasks, the funded flag and
//! an explicit `failed` mark. `StatusAggregator` derives it, writes it back
//! when it changes, and builds progress summaries.

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::amount::format_units;
use crate::core::{CampaignId, CampaignStatus, Task, TaskCampaign, TaskDAG, TaskStatus};
use crate::error::Result;
use crate::orchestration::retry::RetryPolicy;
use crate::state::Store;

/// Derive a campaign's status from its tasks.
///
/// - `Processed` once tasks exist and every one is processed
/// - `Failed` while explicitly marked
/// - `Processing` if any task is in flight, tasks are mixed, or the
///   balance check has passed
/// - `Unprocessed` otherwise
///
/// The `enabled` flag does not take part. A disabled campaign with a mix
/// of processed and unprocessed tasks reports `Processing`; the summary
/// shows it as disabled.
pub fn derive_status(campaign: &TaskCampaign, tasks: &[Task]) -> CampaignStatus {
    if !tasks.is_empty() && tasks.iter().all(Task::is_processed) {
        return CampaignStatus::Processed;
    }
    if campaign.status == CampaignStatus::Failed {
        return CampaignStatus::Failed;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Processing) {
        return CampaignStatus::Processing;
    }
    let untouched = tasks.iter().all(|t| t.status == TaskStatus::Unprocessed);
    if untouched && !campaign.root_has_enough_token {
        CampaignStatus::Unprocessed
    } else {
        CampaignStatus::Processing
    }
}

/// Progress report for one campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSummary {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub enabled: bool,
    pub source_funded: bool,
    pub reverse: bool,
    pub token: String,
    pub decimals: u8,
    pub task_count: usize,
    pub unprocessed: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
    /// Failed tasks whose automatic retries are used up.
    pub exhausted: usize,
    /// Unprocessed tasks waiting behind a failed ancestor.
    pub blocked: usize,
    /// Amount that reached the destination side so far.
    pub delivered_amount: u128,
    /// Amount the campaign moves in total.
    pub total_amount: u128,
}

impl CampaignSummary {
    pub fn is_complete(&self) -> bool {
        self.task_count > 0 && self.processed == self.task_count
    }
}

impl std::fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "campaign {} [{}] {}{}",
            self.campaign_id,
            self.status,
            if self.enabled { "enabled" } else { "disabled" },
            if self.reverse { " (collection)" } else { "" }
        )?;
        writeln!(
            f,
            "  tasks: {} total, {} processed, {} processing, {} failed, {} unprocessed ({} blocked)",
            self.task_count,
            self.processed,
            self.processing,
            self.failed,
            self.unprocessed,
            self.blocked
        )?;
        if self.exhausted > 0 {
            writeln!(f, "  {} failed task(s) need operator attention", self.exhausted)?;
        }
        write!(
            f,
            "  delivered: {} / {} {}",
            format_units(self.delivered_amount, self.decimals),
            format_units(self.total_amount, self.decimals),
            self.token
        )
    }
}

/// Derives and records campaign status.
#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Re-derive the status from stored tasks and persist it if it moved.
    ///
    /// A derived status the stored one cannot legally reach is not written;
    /// the stored status is returned instead.
    pub async fn refresh(&self, campaign_id: &CampaignId) -> Result<CampaignStatus> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        let tasks = self.store.list_tasks(campaign_id).await?;
        let derived = derive_status(&campaign, &tasks);

        if derived == campaign.status {
            return Ok(derived);
        }
        if !campaign.status.can_transition(derived) {
            debug!(
                campaign = %campaign_id,
                from = %campaign.status,
                to = %derived,
                "keeping stored status"
            );
            return Ok(campaign.status);
        }
        self.store
            .update_campaign_status(campaign_id, derived)
            .await?;
        info!(campaign = %campaign_id, from = %campaign.status, to = %derived, "campaign status changed");
        Ok(derived)
    }

    /// Mark the campaign failed if any failed task is out of retries.
    ///
    /// Returns whether the campaign is now marked failed.
    pub async fn mark_failed_if_exhausted(&self, campaign_id: &CampaignId) -> Result<bool> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        let tasks = self.store.list_tasks(campaign_id).await?;
        let exhausted = tasks.iter().filter(|t| self.retry.is_exhausted(t)).count();
        if exhausted == 0 || !campaign.status.can_transition(CampaignStatus::Failed) {
            return Ok(campaign.status == CampaignStatus::Failed);
        }
        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Failed)
            .await?;
        info!(campaign = %campaign_id, exhausted, "campaign marked failed");
        Ok(true)
    }

    /// Counts, blocked tasks and delivered amount.
    pub async fn summary(&self, campaign_id: &CampaignId) -> Result<CampaignSummary> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        let tasks = self.store.list_tasks(campaign_id).await?;
        let status = derive_status(&campaign, &tasks);

        let exhausted = tasks.iter().filter(|t| self.retry.is_exhausted(t)).count();
        let dag = TaskDAG::from_tasks(tasks.clone())?;

        // Tasks nothing depends on deliver to the destination side.
        let delivered_amount = tasks
            .iter()
            .filter(|t| t.is_processed() && dag.get_dependents(&t.id).is_empty())
            .map(|t| t.amount)
            .sum();
        let task_count = dag.task_count();
        let unprocessed = dag.count_status(TaskStatus::Unprocessed);
        let processing = dag.count_status(TaskStatus::Processing);
        let processed = dag.count_status(TaskStatus::Processed);
        let failed = dag.count_status(TaskStatus::Failed);
        let blocked = dag.blocked_by_failures().len();

        Ok(CampaignSummary {
            campaign_id: *campaign_id,
            status,
            enabled: campaign.enabled,
            source_funded: campaign.root_has_enough_token,
            reverse: campaign.reverse,
            token: campaign.token,
            decimals: campaign.decimals,
            task_count,
            unprocessed,
            processing,
            processed,
            failed,
            exhausted,
            blocked,
            delivered_amount,
            total_amount: campaign.total_amount,
        })
    }
}
