use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use washmap::config::Config;
use washmap::core::amount::{format_units, parse_units};
use washmap::core::{CampaignId, MapId, MapSpec, SplitPolicy, Task, TaskId, TaskStatus};
use washmap::orchestration::{RunSummary, SimulatedLedger, TransferClient, TransferRequest};
use washmap::planning::PlanRequest;
use washmap::state::{MemoryStore, Store};
use washmap::{CampaignService, Error, Result, TaskOutcome};

/// washmap - graph-based fund distribution scheduler
#[derive(Parser, Debug)]
#[command(name = "washmap")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WASHMAP_DEBUG=1     Enable debug logging (alternative to --debug)\n    WASHMAP_LOG=<lvl>   Explicit log level or filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.washmap/washmap.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build a distribution map from a TOML specification
    Build {
        /// Path to the map specification
        #[arg(long)]
        spec: PathBuf,
    },

    /// List maps
    Maps,

    /// Plan a campaign over a map (created disabled)
    Plan {
        /// Map ID or short prefix
        map: String,

        /// Token mint or symbol
        #[arg(long)]
        token: String,

        #[arg(long, default_value_t = 0)]
        decimals: u8,

        /// Total amount in token units, e.g. 10000 or 1.5
        #[arg(long)]
        amount: String,

        /// Gas per transfer in base units
        #[arg(long, default_value_t = 0)]
        gas: u128,

        /// Override the map's split policy (equal_leaf, equal_fanout)
        #[arg(long)]
        policy: Option<SplitPolicy>,
    },

    /// List campaigns
    Campaigns {
        /// Only campaigns over this map
        #[arg(long)]
        map: Option<String>,
    },

    /// List the tasks of a campaign in execution order
    Tasks { campaign: String },

    /// Show campaign status and progress
    Status { campaign: String },

    /// Allow a campaign to run
    Enable { campaign: String },

    /// Stop dispatching new tasks for a campaign
    Disable { campaign: String },

    /// Requeue one failed task with a fresh retry budget
    Retry { task: String },

    /// Record the outcome of a task left in flight by a crashed run
    Mark {
        task: String,

        /// Signature of the landed transfer
        #[arg(long, conflicts_with = "error", required_unless_present = "error")]
        signature: Option<String>,

        /// Reason the transfer did not land
        #[arg(long)]
        error: Option<String>,
    },

    /// Rehearse a campaign against a simulated ledger
    Run {
        campaign: String,

        /// Source balance in token units (defaults to exactly what the
        /// campaign needs)
        #[arg(long)]
        balance: Option<String>,
    },

    /// Reset failed tasks, enable and rehearse a campaign
    Resume {
        campaign: String,

        #[arg(long)]
        balance: Option<String>,
    },

    /// Delete a campaign and its tasks
    DeleteCampaign { campaign: String },

    /// Delete a map that no campaign references
    DeleteMap { map: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    washmap::log::init_with_debug(cli.debug);
    info!(command = ?cli.command, "washmap starting");

    let config = Config::load()?;
    Config::ensure_dirs()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Command, config: Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::open(&config.state_path()?).await?);
    let ledger = Arc::new(SimulatedLedger::new());
    let service = CampaignService::new(store, ledger.clone(), ledger.clone(), &config);

    match command {
        Command::Build { spec } => run_build(&service, &config, &spec).await,
        Command::Maps => run_maps(&service).await,
        Command::Plan {
            map,
            token,
            decimals,
            amount,
            gas,
            policy,
        } => {
            let map_id = resolve_map(&service, &map).await?;
            let mut request = PlanRequest::new(&token, decimals, parse_units(&amount, decimals)?, gas);
            if let Some(policy) = policy {
                request = request.with_policy(policy);
            }
            run_plan(&service, &map_id, &request).await
        }
        Command::Campaigns { map } => {
            let map_id = match map {
                Some(map) => Some(resolve_map(&service, &map).await?),
                None => None,
            };
            run_campaigns(&service, map_id.as_ref()).await
        }
        Command::Tasks { campaign } => {
            let id = resolve_campaign(&service, &campaign).await?;
            run_tasks(&service, &id).await
        }
        Command::Status { campaign } => {
            let id = resolve_campaign(&service, &campaign).await?;
            service.status(&id).await?;
            println!("{}", service.summary(&id).await?);
            Ok(())
        }
        Command::Enable { campaign } => {
            let id = resolve_campaign(&service, &campaign).await?;
            service.enable(&id).await?;
            println!("Campaign {} enabled", id.short());
            Ok(())
        }
        Command::Disable { campaign } => {
            let id = resolve_campaign(&service, &campaign).await?;
            if service.disable(&id).await? {
                println!(
                    "Campaign {} disabled and marked failed; resume it to continue",
                    id.short()
                );
            } else {
                println!("Campaign {} disabled", id.short());
            }
            Ok(())
        }
        Command::Retry { task } => {
            let id = resolve_task(&service, &task).await?;
            let task = service.retry_task(&id).await?;
            println!("Task {} (sort {}) requeued", task.id.short(), task.sort_id);
            Ok(())
        }
        Command::Mark {
            task,
            signature,
            error,
        } => {
            let id = resolve_task(&service, &task).await?;
            let outcome = match (signature, error) {
                (Some(signature), _) => TaskOutcome::Landed { signature },
                (None, Some(error)) => TaskOutcome::Failed { error },
                (None, None) => {
                    return Err(Error::Validation(
                        "either --signature or --error is required".to_string(),
                    ))
                }
            };
            let task = service.record_outcome(&id, outcome).await?;
            println!("Task {} is now {}", task.id.short(), task.status);
            Ok(())
        }
        Command::Run { campaign, balance } => {
            let id = resolve_campaign(&service, &campaign).await?;
            prepare_ledger(&service, &ledger, &id, balance.as_deref()).await?;
            let summary = service.run(&id, &shutdown_token()).await?;
            report_run(&service, &summary).await
        }
        Command::Resume { campaign, balance } => {
            let id = resolve_campaign(&service, &campaign).await?;
            prepare_ledger(&service, &ledger, &id, balance.as_deref()).await?;
            let summary = service.resume(&id, &shutdown_token()).await?;
            report_run(&service, &summary).await
        }
        Command::DeleteCampaign { campaign } => {
            let id = resolve_campaign(&service, &campaign).await?;
            service.delete_campaign(&id).await?;
            println!("Campaign {} deleted", id.short());
            Ok(())
        }
        Command::DeleteMap { map } => {
            let id = resolve_map(&service, &map).await?;
            service.delete_map(&id).await?;
            println!("Map {} deleted", id.short());
            Ok(())
        }
    }
}

/// Read a map spec, filling in the configured split policy when the file
/// does not name one.
fn load_spec(path: &Path, config: &Config) -> Result<MapSpec> {
    let mut table: toml::Table = toml::from_str(&std::fs::read_to_string(path)?)?;
    table
        .entry("split_policy")
        .or_insert_with(|| toml::Value::String(config.default_split_policy.to_string()));
    Ok(table.try_into()?)
}

async fn run_build(service: &CampaignService, config: &Config, path: &Path) -> Result<()> {
    let spec = load_spec(path, config)?;
    let map = service.create_map(&spec).await?;
    let nodes = service.list_nodes(&map.id).await?;

    println!("Map {} created", map.id);
    println!("  Project:     {}", map.project);
    println!("  Type:        {}", map.map_type);
    println!(
        "  Shape:       branching {} depth {}",
        map.params.branching_factor, map.params.depth
    );
    println!("  Policy:      {}", map.params.split_policy);
    println!("  Nodes:       {}", nodes.len());
    println!("  Root:        {}", map.root_address);
    Ok(())
}

async fn run_maps(service: &CampaignService) -> Result<()> {
    let maps = service.list_maps().await?;
    if maps.is_empty() {
        println!("No maps");
        return Ok(());
    }
    for map in maps {
        println!(
            "{}  {:<12} {:<8} b={} d={}  {}",
            map.id.short(),
            map.project,
            map.map_type,
            map.params.branching_factor,
            map.params.depth,
            map.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn run_plan(service: &CampaignService, map_id: &MapId, request: &PlanRequest) -> Result<()> {
    let campaign = service.create_plan(map_id, request).await?;
    println!("Campaign {} planned (disabled)", campaign.id);
    println!("  Tasks:       {}", campaign.task_count);
    println!(
        "  Per leaf:    {} {}",
        format_units(campaign.leaf_amount, campaign.decimals),
        campaign.token
    );
    println!(
        "  Total:       {} {}",
        format_units(campaign.total_amount, campaign.decimals),
        campaign.token
    );
    if campaign.dust() > 0 {
        println!(
            "  Dust:        {} {} stays at the source",
            format_units(campaign.dust(), campaign.decimals),
            campaign.token
        );
    }
    println!("  Gas budget:  {}", campaign.gas_budget);
    println!();
    println!("Enable it with: washmap enable {}", campaign.id.short());
    Ok(())
}

async fn run_campaigns(service: &CampaignService, map_id: Option<&MapId>) -> Result<()> {
    let campaigns = service.list_campaigns(map_id).await?;
    if campaigns.is_empty() {
        println!("No campaigns");
        return Ok(());
    }
    for c in campaigns {
        println!(
            "{}  map {}  {:<11} {:<8} {} {}  {} tasks",
            c.id.short(),
            c.map_id.short(),
            c.status.to_string(),
            if c.enabled { "enabled" } else { "disabled" },
            format_units(c.total_amount, c.decimals),
            c.token,
            c.task_count
        );
    }
    Ok(())
}

async fn run_tasks(service: &CampaignService, campaign_id: &CampaignId) -> Result<()> {
    for task in service.list_tasks(campaign_id).await? {
        println!(
            "{:>4}  {}  {:<11} {} -> {}  {}{}",
            task.sort_id,
            task.id.short(),
            task.status.to_string(),
            task.from_address,
            task.to_address,
            format_units(task.amount, task.decimals),
            task.error
                .as_ref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Seed the simulated ledger: fund the source side, then replay transfers
/// that already landed so intermediate wallets hold what they received.
async fn prepare_ledger(
    service: &CampaignService,
    ledger: &SimulatedLedger,
    campaign_id: &CampaignId,
    balance: Option<&str>,
) -> Result<()> {
    let campaign = service.get_campaign(campaign_id).await?;
    let tasks = service.list_tasks(campaign_id).await?;
    let explicit = balance
        .map(|b| parse_units(b, campaign.decimals))
        .transpose()?;

    if campaign.reverse {
        for task in tasks.iter().filter(|t| t.depends_on.is_empty()) {
            let amount = explicit.unwrap_or(task.amount.saturating_add(task.gas));
            ledger.fund(&task.from_address, &campaign.token, amount);
        }
    } else {
        let map = service.get_map(&campaign.map_id).await?;
        let amount =
            explicit.unwrap_or(campaign.total_amount.saturating_add(campaign.gas_budget));
        ledger.fund(&map.root_address, &campaign.token, amount);
    }

    let landed: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Processed)
        .collect();
    for task in &landed {
        if let Err(e) = ledger.submit(&TransferRequest::from(*task)).await {
            warn!(task = %task.id, error = %e, "could not replay landed transfer");
        }
    }
    info!(
        campaign = %campaign_id,
        replayed = landed.len(),
        "simulated ledger prepared"
    );
    Ok(())
}

/// Cancel on Ctrl-C so in-flight transfers drain before exit.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, waiting for in-flight transfers...");
            child.cancel();
        }
    });
    token
}

async fn report_run(service: &CampaignService, summary: &RunSummary) -> Result<()> {
    println!(
        "Run finished: {} dispatched, {} processed, {} failed, {} requeued",
        summary.dispatched, summary.processed, summary.failed, summary.requeued
    );
    if summary.paused {
        println!("Campaign was disabled during the run");
    }
    if summary.cancelled {
        println!("Run was interrupted");
    }
    if summary.stuck > 0 {
        println!(
            "{} task(s) were left in flight by an earlier run; record them with `washmap mark`",
            summary.stuck
        );
    }
    println!();
    println!("{}", service.summary(&summary.campaign_id).await?);
    Ok(())
}

// ---------- id resolution ----------

fn matches_prefix(full: &str, query: &str) -> bool {
    !query.is_empty() && full.starts_with(&query.to_lowercase())
}

fn pick<T: Copy>(kind: &str, query: &str, found: Vec<T>) -> Result<T> {
    match found.as_slice() {
        [one] => Ok(*one),
        [] => Err(Error::Validation(format!("{} not found: {}", kind, query))),
        _ => Err(Error::Validation(format!(
            "{} prefix {} is ambiguous ({} matches)",
            kind,
            query,
            found.len()
        ))),
    }
}

async fn resolve_map(service: &CampaignService, query: &str) -> Result<MapId> {
    if let Ok(id) = query.parse::<MapId>() {
        return Ok(id);
    }
    let found = service
        .list_maps()
        .await?
        .into_iter()
        .map(|m| m.id)
        .filter(|id| matches_prefix(&id.to_string(), query))
        .collect();
    pick("map", query, found)
}

async fn resolve_campaign(service: &CampaignService, query: &str) -> Result<CampaignId> {
    if let Ok(id) = query.parse::<CampaignId>() {
        return Ok(id);
    }
    let found = service
        .list_campaigns(None)
        .await?
        .into_iter()
        .map(|c| c.id)
        .filter(|id| matches_prefix(&id.to_string(), query))
        .collect();
    pick("campaign", query, found)
}

async fn resolve_task(service: &CampaignService, query: &str) -> Result<TaskId> {
    if let Ok(id) = query.parse::<TaskId>() {
        return Ok(id);
    }
    let mut found = Vec::new();
    for campaign in service.list_campaigns(None).await? {
        found.extend(
            service
                .list_tasks(&campaign.id)
                .await?
                .into_iter()
                .map(|t| t.id)
                .filter(|id| matches_prefix(&id.to_string(), query)),
        );
    }
    pick("task", query, found)
}
