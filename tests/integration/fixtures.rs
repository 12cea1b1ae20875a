//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted transfer client (failures, delays, panics, per-call hooks)
//! - Fixed source balances
//! - Building, planning and enabling campaigns through the service

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use washmap::config::{Config, SchedulerConfig};
use washmap::core::{CampaignId, MapSpec, Task, TaskCampaign, TaskId};
use washmap::orchestration::{BalanceQuery, TransferClient, TransferError, TransferRequest};
use washmap::planning::PlanRequest;
use washmap::state::{MemoryStore, Store};
use washmap::CampaignService;

/// Token used by every fixture campaign.
pub const TOKEN: &str = "TOKEN";

/// Root address used by every fixture map.
pub const ROOT: &str = "Root";

/// Side effect run inside the transfer client on a given call.
pub enum Hook {
    /// Disable the campaign, as an operator would mid-run.
    Disable(CampaignId),
    /// Claim a task in the store, as a competing runner would.
    Claim(TaskId),
    /// Fire a cancellation token, as Ctrl-C would.
    Cancel(CancellationToken),
}

/// Transfer client driven by a script instead of a chain.
///
/// Every call is recorded. Destinations can be told to fail a number of
/// times, to respond slowly, or to panic.
pub struct ScriptedClient {
    store: Arc<MemoryStore>,
    calls: Mutex<Vec<TransferRequest>>,
    failures: Mutex<HashMap<String, u32>>,
    slow: Mutex<HashMap<String, Duration>>,
    panics: Mutex<HashSet<String>>,
    hooks: Mutex<HashMap<usize, Hook>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            slow: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            hooks: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` transfers to `address`.
    pub fn fail_to(&self, address: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(address.to_string(), times);
    }

    /// Stop failing transfers to `address`.
    pub fn heal(&self, address: &str) {
        self.failures.lock().unwrap().remove(address);
    }

    pub fn slow_to(&self, address: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(address.to_string(), delay);
    }

    pub fn panic_to(&self, address: &str) {
        self.panics.lock().unwrap().insert(address.to_string());
    }

    /// Delay applied to every transfer.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Run `hook` during the `call`-th transfer (1-based).
    pub fn on_call(&self, call: usize, hook: Hook) {
        self.hooks.lock().unwrap().insert(call, hook);
    }

    pub fn calls(&self) -> Vec<TransferRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of transfers observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferClient for ScriptedClient {
    async fn submit(&self, request: &TransferRequest) -> Result<String, TransferError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        let hook = self.hooks.lock().unwrap().remove(&call);
        match hook {
            Some(Hook::Disable(campaign_id)) => {
                self.store
                    .set_campaign_enabled(&campaign_id, false)
                    .await
                    .unwrap();
            }
            Some(Hook::Claim(task_id)) => {
                assert!(self.store.claim_task(&task_id).await.unwrap());
            }
            Some(Hook::Cancel(token)) => token.cancel(),
            None => {}
        }

        let delay = *self.delay.lock().unwrap()
            + self
                .slow
                .lock()
                .unwrap()
                .get(&request.to)
                .copied()
                .unwrap_or(Duration::ZERO);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.panics.lock().unwrap().contains(&request.to) {
            panic!("signer crashed sending to {}", request.to);
        }

        let failed = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&request.to) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if failed {
            Err(TransferError::new(format!("rpc rejected transfer to {}", request.to)))
        } else {
            Ok(format!("sig-{}", call))
        }
    }
}

/// Balance query answering from a fixed table. Unknown addresses hold 0.
#[derive(Default)]
pub struct FixedBalances {
    balances: Mutex<HashMap<String, u128>>,
}

impl FixedBalances {
    pub fn set(&self, address: &str, amount: u128) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), amount);
    }
}

#[async_trait]
impl BalanceQuery for FixedBalances {
    async fn balance_of(&self, address: &str, _token: &str) -> Result<u128, TransferError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0))
    }
}

/// Scheduler settings that keep tests fast.
pub fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        transfer_timeout_secs: 5,
        max_retries: 3,
        retry_backoff_ms: 1,
    }
}

/// Service wired to a scripted client and fixed balances.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedClient>,
    pub balances: Arc<FixedBalances>,
    pub service: CampaignService,
}

impl Harness {
    pub fn new(scheduler: SchedulerConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), scheduler)
    }

    pub fn with_store(store: Arc<MemoryStore>, scheduler: SchedulerConfig) -> Self {
        let client = Arc::new(ScriptedClient::new(store.clone()));
        let balances = Arc::new(FixedBalances::default());
        let config = Config {
            scheduler,
            ..Default::default()
        };
        let service = CampaignService::new(store.clone(), client.clone(), balances.clone(), &config);
        Self {
            store,
            client,
            balances,
            service,
        }
    }

    /// Build the map, plan it and enable the campaign.
    pub async fn campaign(&self, spec: MapSpec, total: u128, gas: u128) -> TaskCampaign {
        self.campaign_with(spec, PlanRequest::new(TOKEN, 0, total, gas))
            .await
    }

    pub async fn campaign_with(&self, spec: MapSpec, request: PlanRequest) -> TaskCampaign {
        let map = self.service.create_map(&spec).await.unwrap();
        let campaign = self.service.create_plan(&map.id, &request).await.unwrap();
        self.service.enable(&campaign.id).await.unwrap();
        self.service.get_campaign(&campaign.id).await.unwrap()
    }

    pub async fn tasks(&self, campaign_id: &CampaignId) -> Vec<Task> {
        self.service.list_tasks(campaign_id).await.unwrap()
    }

    pub async fn run(&self, campaign_id: &CampaignId) -> washmap::orchestration::RunSummary {
        self.service
            .run(campaign_id, &CancellationToken::new())
            .await
            .unwrap()
    }
}

/// Binary tree of depth 2 with readable addresses.
///
/// ```text
///        Root
///       /    \
///      A      B
///     / \    / \
///    A1 A2  B1 B2
/// ```
pub fn labeled_tree() -> MapSpec {
    MapSpec::new("alpha", ROOT, 2, 2).with_addresses(
        ["A", "B", "A1", "A2", "B1", "B2"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    )
}

/// Assert that every transfer leaves from an address that was funded
/// before it: the root, or the destination of an earlier transfer.
pub fn assert_causal_order(calls: &[TransferRequest], sources: &[&str]) {
    let mut funded: HashSet<String> = sources.iter().map(|s| s.to_string()).collect();
    for call in calls {
        assert!(
            funded.contains(&call.from),
            "{} sent before it was funded",
            call.from
        );
        funded.insert(call.to.clone());
    }
}
