//! Persistence adapter for maps, campaigns and tasks.

use async_trait::async_trait;

use crate::core::{
    CampaignId, CampaignStatus, DistributionMap, Edge, MapGraph, MapId, Node, Task, TaskCampaign,
    TaskId,
};
use crate::error::Result;

/// Storage for distribution maps and the campaigns planned over them.
///
/// Graph creation and plan creation are single calls so an implementation
/// can write every row or none. Campaign updates are field-level so the
/// scheduler and the control surface never overwrite each other's changes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a map together with all of its nodes and edges.
    async fn create_map(&self, map: &DistributionMap, nodes: &[Node], edges: &[Edge])
        -> Result<()>;

    /// Get a map by ID.
    async fn get_map(&self, map_id: &MapId) -> Result<DistributionMap>;

    /// List all maps, oldest first.
    async fn list_maps(&self) -> Result<Vec<DistributionMap>>;

    async fn list_nodes(&self, map_id: &MapId) -> Result<Vec<Node>>;

    async fn list_edges(&self, map_id: &MapId) -> Result<Vec<Edge>>;

    /// Delete a map with its nodes and edges. Refused while any campaign
    /// still references the map.
    async fn delete_map(&self, map_id: &MapId) -> Result<()>;

    /// Persist a campaign together with all of its tasks.
    async fn create_plan(&self, campaign: &TaskCampaign, tasks: &[Task]) -> Result<()>;

    /// Get a campaign by ID.
    async fn get_campaign(&self, campaign_id: &CampaignId) -> Result<TaskCampaign>;

    /// List campaigns, optionally restricted to one map.
    async fn list_campaigns(&self, map_id: Option<&MapId>) -> Result<Vec<TaskCampaign>>;

    /// Move a campaign to `status`, rejecting illegal transitions.
    async fn update_campaign_status(
        &self,
        campaign_id: &CampaignId,
        status: CampaignStatus,
    ) -> Result<()>;

    async fn set_campaign_enabled(&self, campaign_id: &CampaignId, enabled: bool) -> Result<()>;

    /// Record that the source side passed the balance check.
    async fn mark_source_funded(&self, campaign_id: &CampaignId) -> Result<()>;

    /// Delete a campaign and its tasks. Refused while a task is in flight.
    async fn delete_campaign(&self, campaign_id: &CampaignId) -> Result<()>;

    /// Tasks of one campaign ordered by `sort_id`.
    async fn list_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<Task>>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Task>;

    /// Overwrite a task record. The stored status must be able to reach
    /// the new one and a processed task is never rewritten.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Atomically move a task from `unprocessed` to `processing`.
    ///
    /// Returns `false` when the task was not `unprocessed`, meaning another
    /// claimant got there first.
    async fn claim_task(&self, task_id: &TaskId) -> Result<bool>;

    /// Rebuild the address tree of a map.
    async fn load_graph(&self, map_id: &MapId) -> Result<MapGraph> {
        let nodes = self.list_nodes(map_id).await?;
        let edges = self.list_edges(map_id).await?;
        MapGraph::from_records(*map_id, nodes, &edges)
    }
}
