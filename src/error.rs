use thiserror::Error;

use crate::core::{CampaignId, MapId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid map specification: {0}")]
    InvalidSpecification(String),

    #[error("Map {map_id} has no edges to plan")]
    EmptyGraph { map_id: MapId },

    #[error("Amount policy error: {0}")]
    AmountPolicy(String),

    #[error("Insufficient balance at {address}: required {required}, available {available}")]
    InsufficientRootBalance {
        address: String,
        required: u128,
        available: u128,
    },

    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    #[error("Balance query failed: {0}")]
    Balance(String),

    #[error("Task {task_id} was claimed by another worker")]
    ClaimConflict { task_id: TaskId },

    #[error("Unknown map: {0}")]
    UnknownMap(MapId),

    #[error("Unknown campaign: {0}")]
    UnknownCampaign(CampaignId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Worker pool is full (max {max} transfers in flight)")]
    WorkerPoolFull { max: usize },

    #[error("Campaign {0} is disabled")]
    CampaignDisabled(CampaignId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether re-attempting the same operation later can succeed without
    /// the caller changing its input.
    ///
    /// Funding the root, re-running the scheduler after a transfer failure
    /// and losing a claim race are retryable; bad map parameters and
    /// planning errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientRootBalance { .. }
                | Error::TransferFailure(_)
                | Error::Balance(_)
                | Error::ClaimConflict { .. }
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
