//! Campaign control surface.
//!
//! `CampaignService` ties the builder, planner, scheduler and aggregator to
//! one store. It is what the command line drives, and what an outer CRUD
//! layer would call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::{
    CampaignId, CampaignStatus, DistributionMap, MapId, MapSpec, Node, Task, TaskCampaign,
    TaskId, TaskStatus,
};
use crate::error::{Error, Result};
use crate::orchestration::{
    BalanceQuery, CampaignSummary, RetryPolicy, RunSummary, Scheduler, SchedulerEvent,
    StatusAggregator, TransferClient,
};
use crate::planning::{GraphBuilder, PlanRequest, TaskPlanner};
use crate::state::Store;

/// Outcome recorded by an operator for a task left in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The transfer landed with this signature.
    Landed { signature: String },
    /// The transfer did not land.
    Failed { error: String },
}

/// Entry point for building maps, planning and running campaigns.
pub struct CampaignService {
    store: Arc<dyn Store>,
    builder: GraphBuilder,
    planner: TaskPlanner,
    scheduler: Scheduler,
    aggregator: StatusAggregator,
}

impl CampaignService {
    /// Create a service over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Persistence for maps, campaigns and tasks
    /// * `client` - Executes transfers
    /// * `balances` - Answers the pre-run balance check
    /// * `config` - Node limit plus scheduler settings
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn TransferClient>,
        balances: Arc<dyn BalanceQuery>,
        config: &Config,
    ) -> Self {
        let retry = RetryPolicy::from(&config.scheduler);
        Self {
            builder: GraphBuilder::new(config.max_nodes),
            planner: TaskPlanner::new(),
            scheduler: Scheduler::new(store.clone(), client, balances, config.scheduler.clone()),
            aggregator: StatusAggregator::new(store.clone(), retry),
            store,
        }
    }

    /// Forward scheduler lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.scheduler = self.scheduler.with_events(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ---------- maps ----------

    /// Build a map from `spec` and persist it with all nodes and edges.
    pub async fn create_map(&self, spec: &MapSpec) -> Result<DistributionMap> {
        let (map, graph) = self.builder.build(spec)?;
        let nodes: Vec<Node> = graph.nodes().into_iter().cloned().collect();
        self.store.create_map(&map, &nodes, &graph.edges()).await?;
        info!(
            map = %map.id,
            project = %map.project,
            nodes = nodes.len(),
            "map created"
        );
        Ok(map)
    }

    pub async fn get_map(&self, map_id: &MapId) -> Result<DistributionMap> {
        self.store.get_map(map_id).await
    }

    pub async fn list_maps(&self) -> Result<Vec<DistributionMap>> {
        self.store.list_maps().await
    }

    pub async fn list_nodes(&self, map_id: &MapId) -> Result<Vec<Node>> {
        self.store.list_nodes(map_id).await
    }

    pub async fn delete_map(&self, map_id: &MapId) -> Result<()> {
        self.store.delete_map(map_id).await?;
        info!(map = %map_id, "map deleted");
        Ok(())
    }

    // ---------- campaigns ----------

    /// Plan a campaign over a stored map. The campaign is created disabled.
    pub async fn create_plan(
        &self,
        map_id: &MapId,
        request: &PlanRequest,
    ) -> Result<TaskCampaign> {
        let map = self.store.get_map(map_id).await?;
        let graph = self.store.load_graph(map_id).await?;
        let plan = self.planner.plan(&map, &graph, request)?;
        self.store.create_plan(&plan.campaign, &plan.tasks).await?;
        info!(
            campaign = %plan.campaign.id,
            map = %map_id,
            tasks = plan.tasks.len(),
            total = %plan.campaign.total_amount,
            "plan created"
        );
        Ok(plan.campaign)
    }

    pub async fn get_campaign(&self, campaign_id: &CampaignId) -> Result<TaskCampaign> {
        self.store.get_campaign(campaign_id).await
    }

    pub async fn list_campaigns(&self, map_id: Option<&MapId>) -> Result<Vec<TaskCampaign>> {
        self.store.list_campaigns(map_id).await
    }

    pub async fn list_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<Task>> {
        self.store.list_tasks(campaign_id).await
    }

    pub async fn enable(&self, campaign_id: &CampaignId) -> Result<()> {
        self.store.set_campaign_enabled(campaign_id, true).await?;
        info!(campaign = %campaign_id, "campaign enabled");
        Ok(())
    }

    /// Disable a campaign. A running scheduler stops dispatching new tasks
    /// and lets in-flight transfers finish.
    ///
    /// Returns `true` when the campaign was marked failed because a failed
    /// task has no automatic retries left.
    pub async fn disable(&self, campaign_id: &CampaignId) -> Result<bool> {
        self.store.set_campaign_enabled(campaign_id, false).await?;
        let failed = self.aggregator.mark_failed_if_exhausted(campaign_id).await?;
        info!(campaign = %campaign_id, failed, "campaign disabled");
        Ok(failed)
    }

    pub async fn delete_campaign(&self, campaign_id: &CampaignId) -> Result<()> {
        self.store.delete_campaign(campaign_id).await?;
        info!(campaign = %campaign_id, "campaign deleted");
        Ok(())
    }

    // ---------- execution ----------

    /// Run an enabled campaign until no task can make progress.
    pub async fn run(
        &self,
        campaign_id: &CampaignId,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        self.scheduler.run(campaign_id, cancel).await
    }

    /// Give every failed task a fresh retry budget, clear a failed mark,
    /// enable the campaign and run it.
    pub async fn resume(
        &self,
        campaign_id: &CampaignId,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let mut reset = 0;
        for mut task in self.store.list_tasks(campaign_id).await? {
            if task.status == TaskStatus::Failed {
                task.attempts = 0;
                task.requeue()?;
                self.store.update_task(&task).await?;
                reset += 1;
            }
        }
        self.clear_failed_mark(campaign_id).await?;
        self.store.set_campaign_enabled(campaign_id, true).await?;
        info!(campaign = %campaign_id, reset, "campaign resumed");
        self.scheduler.run(campaign_id, cancel).await
    }

    /// Return one failed task to the queue with a fresh retry budget.
    pub async fn retry_task(&self, task_id: &TaskId) -> Result<Task> {
        let mut task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Unprocessed.to_string(),
            });
        }
        task.attempts = 0;
        task.requeue()?;
        self.store.update_task(&task).await?;
        self.clear_failed_mark(&task.campaign_id).await?;
        info!(task = %task_id, campaign = %task.campaign_id, "task requeued");
        Ok(task)
    }

    /// Record the outcome of a task left `processing`, typically by a run
    /// that crashed before the transfer result came back.
    pub async fn record_outcome(&self, task_id: &TaskId, outcome: TaskOutcome) -> Result<Task> {
        let mut task = self.store.get_task(task_id).await?;
        match &outcome {
            TaskOutcome::Landed { signature } => task.complete(signature)?,
            TaskOutcome::Failed { error } => task.fail(error)?,
        }
        self.store.update_task(&task).await?;
        info!(task = %task_id, status = %task.status, "task outcome recorded");
        self.aggregator.refresh(&task.campaign_id).await?;
        Ok(task)
    }

    // ---------- status ----------

    /// Current campaign status, re-derived from its tasks.
    pub async fn status(&self, campaign_id: &CampaignId) -> Result<CampaignStatus> {
        self.aggregator.refresh(campaign_id).await
    }

    pub async fn summary(&self, campaign_id: &CampaignId) -> Result<CampaignSummary> {
        self.aggregator.summary(campaign_id).await
    }

    async fn clear_failed_mark(&self, campaign_id: &CampaignId) -> Result<()> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Failed {
            self.store
                .update_campaign_status(campaign_id, CampaignStatus::Processing)
                .await?;
        }
        Ok(())
    }
}
