//! External collaborators: the transfer facility and the balance query.
//!
//! Signing and RPC submission live behind these traits. The crate ships a
//! `SimulatedLedger` that implements both, used for rehearsals from the
//! command line and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::Task;

/// Opaque error returned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransferError(pub String);

impl TransferError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One token transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub token: String,
    /// Amount in base units.
    pub amount: u128,
    pub decimals: u8,
}

impl From<&Task> for TransferRequest {
    fn from(task: &Task) -> Self {
        Self {
            from: task.from_address.clone(),
            to: task.to_address.clone(),
            token: task.token.clone(),
            amount: task.amount,
            decimals: task.decimals,
        }
    }
}

/// Executes a single transfer and returns its signature.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn submit(&self, request: &TransferRequest) -> Result<String, TransferError>;
}

/// Reports the balance of an address in base units.
#[async_trait]
pub trait BalanceQuery: Send + Sync {
    async fn balance_of(&self, address: &str, token: &str) -> Result<u128, TransferError>;
}

/// In-memory ledger that moves balances on every transfer.
///
/// A transfer from an address that cannot cover the amount fails the way
/// a chain would reject it. Signatures are sequential.
#[derive(Debug, Default)]
pub struct SimulatedLedger {
    balances: Mutex<HashMap<(String, String), u128>>,
    sequence: AtomicU64,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` to `address`.
    pub fn fund(&self, address: &str, token: &str, amount: u128) {
        if let Ok(mut balances) = self.balances.lock() {
            let entry = balances
                .entry((address.to_string(), token.to_string()))
                .or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    /// Current balance, zero for unknown addresses.
    pub fn balance(&self, address: &str, token: &str) -> u128 {
        self.balances
            .lock()
            .ok()
            .and_then(|b| b.get(&(address.to_string(), token.to_string())).copied())
            .unwrap_or(0)
    }

    /// Number of transfers that landed.
    pub fn transfer_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferClient for SimulatedLedger {
    async fn submit(&self, request: &TransferRequest) -> Result<String, TransferError> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| TransferError::new("ledger lock poisoned"))?;
        let from_key = (request.from.clone(), request.token.clone());
        let available = balances.get(&from_key).copied().unwrap_or(0);
        if available < request.amount {
            return Err(TransferError(format!(
                "{} holds {} {} but the transfer needs {}",
                request.from, available, request.token, request.amount
            )));
        }
        balances.insert(from_key, available - request.amount);
        let to = balances
            .entry((request.to.clone(), request.token.clone()))
            .or_insert(0);
        *to = to.saturating_add(request.amount);

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sim-{:08}", n))
    }
}

#[async_trait]
impl BalanceQuery for SimulatedLedger {
    async fn balance_of(&self, address: &str, token: &str) -> Result<u128, TransferError> {
        Ok(self.balance(address, token))
    }
}
