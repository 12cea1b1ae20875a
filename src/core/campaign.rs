//! Task campaign aggregate: one execution run over a distribution map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CampaignId, MapId};
use super::map::SplitPolicy;
use crate::error::{Error, Result};

/// Overall status of a campaign, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// No task has left `unprocessed` and the balance gate has not passed.
    #[default]
    Unprocessed,
    /// Execution has started.
    Processing,
    /// Every task is processed.
    Processed,
    /// Explicitly marked failed by an operator after retries ran out.
    Failed,
}

impl CampaignStatus {
    /// Check if moving from the current status to `target` is allowed.
    ///
    /// Staying in place is always allowed. `Processed` is terminal.
    pub fn can_transition(&self, target: CampaignStatus) -> bool {
        *self == target
            || matches!(
                (self, target),
                (CampaignStatus::Unprocessed, CampaignStatus::Processing)
                    | (CampaignStatus::Unprocessed, CampaignStatus::Processed)
                    | (CampaignStatus::Unprocessed, CampaignStatus::Failed)
                    | (CampaignStatus::Processing, CampaignStatus::Processed)
                    | (CampaignStatus::Processing, CampaignStatus::Failed)
                    | (CampaignStatus::Failed, CampaignStatus::Unprocessed)
                    | (CampaignStatus::Failed, CampaignStatus::Processing)
                    | (CampaignStatus::Failed, CampaignStatus::Processed)
            )
    }

    pub fn transition(&self, target: CampaignStatus) -> Result<CampaignStatus> {
        if self.can_transition(target) {
            Ok(target)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Unprocessed => write!(f, "unprocessed"),
            CampaignStatus::Processing => write!(f, "processing"),
            CampaignStatus::Processed => write!(f, "processed"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One execution run over a distribution map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCampaign {
    pub id: CampaignId,
    pub map_id: MapId,
    pub token: String,
    pub decimals: u8,
    pub split_policy: SplitPolicy,
    /// Amount the source side sends, in base units.
    pub total_amount: u128,
    /// Amount requested by the operator before integer splitting.
    pub requested_amount: u128,
    /// Amount each leaf receives (or sends, for collection).
    pub leaf_amount: u128,
    pub leaf_count: u32,
    pub task_count: u32,
    /// Sum of every task's gas.
    pub gas_budget: u128,
    pub reverse: bool,
    /// Execution gate; campaigns are created disabled.
    pub enabled: bool,
    /// Set once the precondition balance check has passed.
    pub root_has_enough_token: bool,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskCampaign {
    /// Dust left at the source by integer division.
    pub fn dust(&self) -> u128 {
        self.requested_amount.saturating_sub(self.total_amount)
    }
}
