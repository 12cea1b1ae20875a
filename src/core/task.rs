//! Transfer task data model.
//!
//! A task is one concrete transfer along one edge of a map. Each task
//! tracks its status, the transfer parameters copied at planning time,
//! and the result of execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CampaignId, NodeId, TaskId};
use crate::error::{Error, Result};

/// Task status in its lifecycle.
///
/// `Unprocessed -> Processing -> {Processed | Failed}`, and
/// `Failed -> Unprocessed` when a retry is requested. `Processed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planned, not yet claimed by a worker.
    #[default]
    Unprocessed,
    /// Claimed by exactly one worker; a transfer may be in flight.
    Processing,
    /// Transfer landed and its signature is recorded.
    Processed,
    /// Transfer failed or timed out.
    Failed,
}

impl TaskStatus {
    pub fn can_transition(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Unprocessed, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Processed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Unprocessed)
        )
    }

    fn check_transition(&self, target: TaskStatus) -> Result<()> {
        if self.can_transition(target) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Unprocessed => write!(f, "unprocessed"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Processed => write!(f, "processed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single planned transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Position in the campaign's execution order.
    pub sort_id: u32,
    /// Node funds leave from.
    pub from_node: NodeId,
    /// Node funds arrive at.
    pub to_node: NodeId,
    /// Address of `from_node`, copied at planning time.
    pub from_address: String,
    /// Address of `to_node`, copied at planning time.
    pub to_address: String,
    pub token: String,
    pub decimals: u8,
    /// Amount in base units.
    pub amount: u128,
    /// Gas budgeted for this transfer, in base units of the fee token.
    pub gas: u128,
    /// True for collection tasks (leaf -> root).
    pub reverse: bool,
    /// Tasks that must be processed before this one may start.
    pub depends_on: Vec<TaskId>,
    /// Transfer attempts made so far, including the first.
    #[serde(default)]
    pub attempts: u32,
    /// Signature returned by the transfer client.
    pub signature: Option<String>,
    pub is_success: bool,
    pub status: TaskStatus,
    /// Last transfer error, kept after a retry for diagnosis.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Claim the task for execution.
    pub fn start(&mut self) -> Result<()> {
        self.status.check_transition(TaskStatus::Processing)?;
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        Ok(())
    }

    /// Record a landed transfer.
    pub fn complete(&mut self, signature: &str) -> Result<()> {
        self.status.check_transition(TaskStatus::Processed)?;
        self.status = TaskStatus::Processed;
        self.signature = Some(signature.to_string());
        self.is_success = true;
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed transfer. `is_success` stays false.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.status.check_transition(TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.is_success = false;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Return a failed task to the queue.
    pub fn requeue(&mut self) -> Result<()> {
        self.status.check_transition(TaskStatus::Unprocessed)?;
        self.status = TaskStatus::Unprocessed;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    pub fn is_processed(&self) -> bool {
        self.status == TaskStatus::Processed
    }

    /// Whether the task still needs a transfer (unprocessed or failed).
    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Unprocessed | TaskStatus::Failed)
    }
}
