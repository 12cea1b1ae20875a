//! In-memory store with an optional JSON snapshot on disk.
//!
//! Every committed write is followed by a full snapshot written to a temp
//! file and renamed into place, so a reader of the state file sees either
//! the old tables or the new ones. Writes hold the table lock until the
//! snapshot lands, which keeps snapshots in commit order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::store::Store;
use crate::core::{
    CampaignId, CampaignStatus, DistributionMap, Edge, MapId, Node, Task, TaskCampaign, TaskId,
    TaskStatus,
};
use crate::error::{Error, Result};
use crate::util::blocking;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    maps: HashMap<MapId, DistributionMap>,
    nodes: HashMap<MapId, Vec<Node>>,
    edges: HashMap<MapId, Vec<Edge>>,
    campaigns: HashMap<CampaignId, TaskCampaign>,
    /// Tasks per campaign, ordered by `sort_id`.
    tasks: HashMap<CampaignId, Vec<Task>>,
    #[serde(skip)]
    task_index: HashMap<TaskId, (CampaignId, usize)>,
}

impl Tables {
    fn reindex(&mut self) {
        self.task_index.clear();
        for (campaign_id, tasks) in &self.tasks {
            for (pos, task) in tasks.iter().enumerate() {
                self.task_index.insert(task.id, (*campaign_id, pos));
            }
        }
    }

    fn campaign_mut(&mut self, campaign_id: &CampaignId) -> Result<&mut TaskCampaign> {
        self.campaigns
            .get_mut(campaign_id)
            .ok_or(Error::UnknownCampaign(*campaign_id))
    }

    fn task_mut(&mut self, task_id: &TaskId) -> Result<&mut Task> {
        let (campaign_id, pos) = self
            .task_index
            .get(task_id)
            .copied()
            .ok_or(Error::TaskNotFound(*task_id))?;
        self.tasks
            .get_mut(&campaign_id)
            .and_then(|tasks| tasks.get_mut(pos))
            .ok_or(Error::TaskNotFound(*task_id))
    }
}

/// `Store` backed by in-process tables.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store; nothing is written to disk.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            path: None,
        }
    }

    /// Store snapshotted to `path`, loading the existing snapshot if any.
    pub async fn open(path: &Path) -> Result<Self> {
        let load_path = path.to_path_buf();
        let tables = blocking(move || {
            if !load_path.exists() {
                debug!(path = %load_path.display(), "state file not found, starting empty");
                return Ok(Tables::default());
            }
            let contents = fs::read_to_string(&load_path)?;
            let mut tables: Tables = serde_json::from_str(&contents)?;
            tables.reindex();
            Ok(tables)
        })
        .await?;

        debug!(
            path = %path.display(),
            maps = tables.maps.len(),
            campaigns = tables.campaigns.len(),
            "state loaded"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let contents = serde_json::to_vec(tables)?;
        blocking(move || {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() && !dir.exists() {
                    fs::create_dir_all(dir)?;
                }
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })
        .await
    }

    /// Snapshot a write. If the snapshot fails, `undo` reverts the tables
    /// so memory matches the last snapshot that landed.
    async fn commit<F>(&self, tables: &mut Tables, undo: F) -> Result<()>
    where
        F: FnOnce(&mut Tables) + Send,
    {
        if let Err(e) = self.persist(tables).await {
            undo(tables);
            warn!(error = %e, "snapshot failed, write rolled back");
            return Err(e);
        }
        Ok(())
    }
}

fn restore_campaign(previous: TaskCampaign) -> impl FnOnce(&mut Tables) + Send {
    move |tables| {
        tables.campaigns.insert(previous.id, previous);
    }
}

fn restore_task(previous: Task) -> impl FnOnce(&mut Tables) + Send {
    move |tables| {
        if let Ok(slot) = tables.task_mut(&previous.id) {
            *slot = previous;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_map(
        &self,
        map: &DistributionMap,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<()> {
        if let Some(stray) = nodes.iter().find(|n| n.map_id != map.id) {
            return Err(Error::Validation(format!(
                "node {} does not belong to map {}",
                stray.id, map.id
            )));
        }
        if let Some(stray) = edges.iter().find(|e| e.map_id != map.id) {
            return Err(Error::Validation(format!(
                "edge {} -> {} does not belong to map {}",
                stray.from_node, stray.to_node, map.id
            )));
        }

        let mut tables = self.tables.write().await;
        if tables.maps.contains_key(&map.id) {
            return Err(Error::Validation(format!("map {} already exists", map.id)));
        }
        tables.maps.insert(map.id, map.clone());
        tables.nodes.insert(map.id, nodes.to_vec());
        tables.edges.insert(map.id, edges.to_vec());

        let map_id = map.id;
        self.commit(&mut tables, move |t| {
            t.maps.remove(&map_id);
            t.nodes.remove(&map_id);
            t.edges.remove(&map_id);
        })
        .await
    }

    async fn get_map(&self, map_id: &MapId) -> Result<DistributionMap> {
        let tables = self.tables.read().await;
        tables
            .maps
            .get(map_id)
            .cloned()
            .ok_or(Error::UnknownMap(*map_id))
    }

    async fn list_maps(&self) -> Result<Vec<DistributionMap>> {
        let tables = self.tables.read().await;
        let mut maps: Vec<DistributionMap> = tables.maps.values().cloned().collect();
        maps.sort_by_key(|m| m.created_at);
        Ok(maps)
    }

    async fn list_nodes(&self, map_id: &MapId) -> Result<Vec<Node>> {
        let tables = self.tables.read().await;
        tables
            .nodes
            .get(map_id)
            .cloned()
            .ok_or(Error::UnknownMap(*map_id))
    }

    async fn list_edges(&self, map_id: &MapId) -> Result<Vec<Edge>> {
        let tables = self.tables.read().await;
        tables
            .edges
            .get(map_id)
            .cloned()
            .ok_or(Error::UnknownMap(*map_id))
    }

    async fn delete_map(&self, map_id: &MapId) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.maps.contains_key(map_id) {
            return Err(Error::UnknownMap(*map_id));
        }
        let referencing = tables
            .campaigns
            .values()
            .filter(|c| c.map_id == *map_id)
            .count();
        if referencing > 0 {
            return Err(Error::Validation(format!(
                "map {} is still used by {} campaign(s)",
                map_id, referencing
            )));
        }
        let map = tables.maps.remove(map_id);
        let nodes = tables.nodes.remove(map_id);
        let edges = tables.edges.remove(map_id);
        let map_id = *map_id;
        self.commit(&mut tables, move |t| {
            if let Some(map) = map {
                t.maps.insert(map_id, map);
            }
            if let Some(nodes) = nodes {
                t.nodes.insert(map_id, nodes);
            }
            if let Some(edges) = edges {
                t.edges.insert(map_id, edges);
            }
        })
        .await
    }

    async fn create_plan(&self, campaign: &TaskCampaign, tasks: &[Task]) -> Result<()> {
        if let Some(stray) = tasks.iter().find(|t| t.campaign_id != campaign.id) {
            return Err(Error::Validation(format!(
                "task {} does not belong to campaign {}",
                stray.id, campaign.id
            )));
        }

        let mut tables = self.tables.write().await;
        if !tables.maps.contains_key(&campaign.map_id) {
            return Err(Error::UnknownMap(campaign.map_id));
        }
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(Error::Validation(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }

        let mut ordered = tasks.to_vec();
        ordered.sort_by_key(|t| t.sort_id);
        for (pos, task) in ordered.iter().enumerate() {
            tables.task_index.insert(task.id, (campaign.id, pos));
        }
        tables.campaigns.insert(campaign.id, campaign.clone());
        tables.tasks.insert(campaign.id, ordered);

        let campaign_id = campaign.id;
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        self.commit(&mut tables, move |t| {
            t.campaigns.remove(&campaign_id);
            t.tasks.remove(&campaign_id);
            for id in &task_ids {
                t.task_index.remove(id);
            }
        })
        .await
    }

    async fn get_campaign(&self, campaign_id: &CampaignId) -> Result<TaskCampaign> {
        let tables = self.tables.read().await;
        tables
            .campaigns
            .get(campaign_id)
            .cloned()
            .ok_or(Error::UnknownCampaign(*campaign_id))
    }

    async fn list_campaigns(&self, map_id: Option<&MapId>) -> Result<Vec<TaskCampaign>> {
        let tables = self.tables.read().await;
        let mut campaigns: Vec<TaskCampaign> = tables
            .campaigns
            .values()
            .filter(|c| map_id.map_or(true, |id| c.map_id == *id))
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        campaign_id: &CampaignId,
        status: CampaignStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let campaign = tables.campaign_mut(campaign_id)?;
        if campaign.status == status {
            return Ok(());
        }
        let previous = campaign.clone();
        campaign.status = campaign.status.transition(status)?;
        campaign.updated_at = Utc::now();
        self.commit(&mut tables, restore_campaign(previous)).await
    }

    async fn set_campaign_enabled(&self, campaign_id: &CampaignId, enabled: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        let campaign = tables.campaign_mut(campaign_id)?;
        if campaign.enabled == enabled {
            return Ok(());
        }
        let previous = campaign.clone();
        campaign.enabled = enabled;
        campaign.updated_at = Utc::now();
        self.commit(&mut tables, restore_campaign(previous)).await
    }

    async fn mark_source_funded(&self, campaign_id: &CampaignId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let campaign = tables.campaign_mut(campaign_id)?;
        if campaign.root_has_enough_token {
            return Ok(());
        }
        let previous = campaign.clone();
        campaign.root_has_enough_token = true;
        campaign.updated_at = Utc::now();
        self.commit(&mut tables, restore_campaign(previous)).await
    }

    async fn delete_campaign(&self, campaign_id: &CampaignId) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.campaigns.contains_key(campaign_id) {
            return Err(Error::UnknownCampaign(*campaign_id));
        }
        let in_flight = tables
            .tasks
            .get(campaign_id)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Processing)
                    .count()
            })
            .unwrap_or(0);
        if in_flight > 0 {
            return Err(Error::Validation(format!(
                "campaign {} has {} task(s) in flight",
                campaign_id, in_flight
            )));
        }

        let campaign = tables.campaigns.remove(campaign_id);
        let tasks = tables.tasks.remove(campaign_id);
        if let Some(tasks) = &tasks {
            for task in tasks {
                tables.task_index.remove(&task.id);
            }
        }
        let campaign_id = *campaign_id;
        self.commit(&mut tables, move |t| {
            if let Some(campaign) = campaign {
                t.campaigns.insert(campaign_id, campaign);
            }
            if let Some(tasks) = tasks {
                for (pos, task) in tasks.iter().enumerate() {
                    t.task_index.insert(task.id, (campaign_id, pos));
                }
                t.tasks.insert(campaign_id, tasks);
            }
        })
        .await
    }

    async fn list_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        if !tables.campaigns.contains_key(campaign_id) {
            return Err(Error::UnknownCampaign(*campaign_id));
        }
        Ok(tables.tasks.get(campaign_id).cloned().unwrap_or_default())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        let tables = self.tables.read().await;
        let (campaign_id, pos) = tables
            .task_index
            .get(task_id)
            .copied()
            .ok_or(Error::TaskNotFound(*task_id))?;
        tables
            .tasks
            .get(&campaign_id)
            .and_then(|tasks| tasks.get(pos))
            .cloned()
            .ok_or(Error::TaskNotFound(*task_id))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables.task_mut(&task.id)?;
        if stored.status != task.status && !stored.status.can_transition(task.status) {
            return Err(Error::InvalidTransition {
                from: stored.status.to_string(),
                to: task.status.to_string(),
            });
        }
        if stored.status == TaskStatus::Processed && stored != task {
            return Err(Error::Validation(format!(
                "task {} is processed and cannot change",
                task.id
            )));
        }
        let previous = std::mem::replace(stored, task.clone());
        self.commit(&mut tables, restore_task(previous)).await
    }

    async fn claim_task(&self, task_id: &TaskId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let task = tables.task_mut(task_id)?;
        if task.status != TaskStatus::Unprocessed {
            return Ok(false);
        }
        let previous = task.clone();
        task.start()?;
        self.commit(&mut tables, restore_task(previous)).await?;
        Ok(true)
    }
}
