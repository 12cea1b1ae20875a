//! Orchestration layer for campaign execution.
//!
//! This module drives the transfers of a planned campaign: the scheduler
//! dispatches ready tasks to a bounded worker pool, the retry policy decides
//! which failures are requeued, and the aggregator derives campaign status
//! from task state. Signing and submission sit behind the traits in
//! `transfer`.

mod aggregator;
mod pool;
mod retry;
mod scheduler;
mod transfer;

pub use aggregator::{derive_status, CampaignSummary, StatusAggregator};
pub use pool::{WorkerEvent, WorkerPool};
pub use retry::{RetryPolicy, DEFAULT_MAX_RETRIES, MAX_BACKOFF};
pub use scheduler::{RunSummary, Scheduler, SchedulerEvent};
pub use transfer::{BalanceQuery, SimulatedLedger, TransferClient, TransferError, TransferRequest};
