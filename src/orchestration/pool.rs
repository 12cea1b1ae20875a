//! Worker pool for concurrent transfers.
//!
//! The `WorkerPool` spawns one tokio task per transfer, enforces the
//! `max_concurrent` limit, and reports each outcome back over a channel.
//! A worker always sends exactly one event, even when the transfer client
//! panics or exceeds its timeout.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::transfer::{TransferClient, TransferRequest};

/// Outcome of one transfer, sent by a worker when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The transfer landed.
    Landed {
        /// The task the transfer belongs to.
        task_id: TaskId,
        /// Signature returned by the transfer client.
        signature: String,
    },
    /// The transfer failed, timed out or panicked.
    Failed {
        /// The task the transfer belongs to.
        task_id: TaskId,
        /// Error message describing the failure.
        error: String,
    },
}

impl WorkerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerEvent::Landed { task_id, .. } | WorkerEvent::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Manages in-flight transfer workers.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::mpsc;
/// use washmap::orchestration::{WorkerPool, WorkerEvent};
///
/// let (tx, mut rx) = mpsc::channel(8);
/// let mut pool = WorkerPool::new(8, Duration::from_secs(30), tx);
/// pool.spawn(task_id, request, client.clone())?;
/// let event = rx.recv().await;
/// ```
pub struct WorkerPool {
    /// Tasks with a transfer in flight.
    active: HashSet<TaskId>,
    /// Maximum number of concurrent transfers allowed.
    max_concurrent: usize,
    /// Per-transfer deadline.
    transfer_timeout: Duration,
    /// Channel for worker outcomes.
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerPool {
    /// Create a pool. The channel should hold at least `max_concurrent`
    /// events so finishing workers never wait on the receiver.
    pub fn new(
        max_concurrent: usize,
        transfer_timeout: Duration,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            active: HashSet::new(),
            max_concurrent,
            transfer_timeout,
            event_tx,
        }
    }

    /// Spawn a worker that submits `request`.
    ///
    /// # Errors
    ///
    /// Returns `Error::WorkerPoolFull` if the pool is at capacity.
    pub fn spawn(
        &mut self,
        task_id: TaskId,
        request: TransferRequest,
        client: Arc<dyn TransferClient>,
    ) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        self.active.insert(task_id);

        let tx = self.event_tx.clone();
        let deadline = self.transfer_timeout;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(execute(client, request, deadline))
                .catch_unwind()
                .await;
            let event = match outcome {
                Ok(Ok(signature)) => WorkerEvent::Landed { task_id, signature },
                Ok(Err(e)) => WorkerEvent::Failed {
                    task_id,
                    error: e.to_string(),
                },
                Err(panic) => WorkerEvent::Failed {
                    task_id,
                    error: format!("transfer panicked: {}", panic_message(panic.as_ref())),
                },
            };
            if tx.send(event).await.is_err() {
                warn!(task = %task_id, "scheduler stopped before the transfer outcome arrived");
            }
        });

        debug!(task = %task_id, active = self.active.len(), "worker spawned");
        Ok(())
    }

    /// Release the slot held by a finished worker.
    ///
    /// Returns `false` if the task was not in flight.
    pub fn finish(&mut self, task_id: &TaskId) -> bool {
        self.active.remove(task_id)
    }

    /// Tasks currently in flight.
    pub fn active(&self) -> &HashSet<TaskId> {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

async fn execute(
    client: Arc<dyn TransferClient>,
    request: TransferRequest,
    deadline: Duration,
) -> Result<String> {
    match timeout(deadline, client.submit(&request)).await {
        Ok(Ok(signature)) => Ok(signature),
        Ok(Err(e)) => Err(Error::TransferFailure(e.0)),
        Err(_) => Err(Error::Timeout(deadline)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
