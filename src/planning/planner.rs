//! Task planner: expands a built map into an ordered set of transfer tasks.
//!
//! Every edge becomes exactly one task. Distribution tasks flow parent to
//! child and are numbered breadth-first from the root; collection tasks
//! flow child to parent and are numbered level by level from the leaves
//! up. Either way a task's `sort_id` is greater than the `sort_id` of every
//! task it depends on.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use crate::core::amount::MAX_DECIMALS;
use crate::core::{
    CampaignId, CampaignStatus, DistributionMap, MapGraph, Node, NodeId, NodeType, SplitPolicy,
    Task, TaskCampaign, TaskId, TaskStatus,
};
use crate::error::{Error, Result};

/// Parameters of one plan, supplied by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub token: String,
    pub decimals: u8,
    /// Amount to move, in base units, before integer splitting.
    pub total_amount: u128,
    /// Gas budgeted per transfer, in base units of the fee token.
    pub gas_per_transfer: u128,
    /// Overrides the map's split policy when set.
    pub policy: Option<SplitPolicy>,
}

impl PlanRequest {
    pub fn new(token: &str, decimals: u8, total_amount: u128, gas_per_transfer: u128) -> Self {
        Self {
            token: token.to_string(),
            decimals,
            total_amount,
            gas_per_transfer,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: SplitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// A campaign and its tasks, ready to be written in one store call.
#[derive(Debug, Clone)]
pub struct Plan {
    pub campaign: TaskCampaign,
    /// Tasks ordered by `sort_id`.
    pub tasks: Vec<Task>,
}

/// Plans campaigns over built maps.
#[derive(Debug, Clone, Default)]
pub struct TaskPlanner;

impl TaskPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan a campaign over `graph`.
    ///
    /// # Errors
    /// - `Error::EmptyGraph` if the map has no edges
    /// - `Error::AmountPolicy` if the total is zero, any computed amount
    ///   is zero, or the gas budget overflows
    /// - `Error::Validation` for a blank token or unsupported decimals
    pub fn plan(
        &self,
        map: &DistributionMap,
        graph: &MapGraph,
        request: &PlanRequest,
    ) -> Result<Plan> {
        if graph.edge_count() == 0 {
            return Err(Error::EmptyGraph { map_id: map.id });
        }
        if request.token.trim().is_empty() {
            return Err(Error::Validation("token is empty".to_string()));
        }
        if request.decimals > MAX_DECIMALS {
            return Err(Error::Validation(format!(
                "decimals {} exceeds {}",
                request.decimals, MAX_DECIMALS
            )));
        }
        if request.total_amount == 0 {
            return Err(Error::AmountPolicy("total amount is zero".to_string()));
        }

        let policy = request.policy.unwrap_or(map.params.split_policy);
        let reverse = map.map_type.is_reverse();
        let leaf_count = graph.leaves().len() as u128;
        let leaf_amount = request.total_amount / leaf_count;
        if leaf_amount == 0 {
            return Err(Error::AmountPolicy(format!(
                "{} base units cannot be split across {} leaves",
                request.total_amount, leaf_count
            )));
        }

        // Collection moves whatever each subtree holds, so it always uses
        // subtree sums; the policy only fixes the per-leaf amount.
        let amounts = if reverse || policy == SplitPolicy::EqualLeaf {
            equal_leaf_amounts(graph, leaf_amount)
        } else {
            equal_fanout_amounts(graph, request.total_amount)?
        };

        let order = if reverse {
            collection_order(graph)
        } else {
            graph
                .breadth_first()
                .into_iter()
                .filter(|n| n.node_type != NodeType::Root)
                .collect()
        };

        let campaign_id = CampaignId::new();
        let now = Utc::now();
        // Task id of the edge arriving at / leaving each node.
        let mut inbound: HashMap<NodeId, TaskId> = HashMap::new();
        let mut from_children: HashMap<NodeId, Vec<TaskId>> = HashMap::new();
        let mut tasks = Vec::with_capacity(order.len());

        for (sort_id, child) in order.into_iter().enumerate() {
            let parent = graph.parent_of(&child.id).ok_or_else(|| {
                Error::Validation(format!("node {} has no parent", child.label))
            })?;
            let amount = amounts.get(&child.id).copied().unwrap_or(0);
            if amount == 0 {
                return Err(Error::AmountPolicy(format!(
                    "edge {} -> {} carries zero",
                    parent.label, child.label
                )));
            }

            let id = TaskId::new();
            let (from, to, depends_on) = if reverse {
                let deps = from_children.remove(&child.id).unwrap_or_default();
                from_children.entry(parent.id).or_default().push(id);
                (child, parent, deps)
            } else {
                let deps = inbound.get(&parent.id).copied().into_iter().collect();
                inbound.insert(child.id, id);
                (parent, child, deps)
            };

            tasks.push(Task {
                id,
                campaign_id,
                sort_id: sort_id as u32,
                from_node: from.id,
                to_node: to.id,
                from_address: from.address.clone(),
                to_address: to.address.clone(),
                token: request.token.clone(),
                decimals: request.decimals,
                amount,
                gas: request.gas_per_transfer,
                reverse,
                depends_on,
                attempts: 0,
                signature: None,
                is_success: false,
                status: TaskStatus::Unprocessed,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            });
        }

        let total_amount = source_outflow(graph, &amounts, reverse, leaf_amount, leaf_count);
        let gas_budget = request
            .gas_per_transfer
            .checked_mul(tasks.len() as u128)
            .ok_or_else(|| Error::AmountPolicy("gas budget overflows".to_string()))?;

        let campaign = TaskCampaign {
            id: campaign_id,
            map_id: map.id,
            token: request.token.clone(),
            decimals: request.decimals,
            split_policy: policy,
            total_amount,
            requested_amount: request.total_amount,
            leaf_amount,
            leaf_count: leaf_count as u32,
            task_count: tasks.len() as u32,
            gas_budget,
            reverse,
            enabled: false,
            root_has_enough_token: false,
            status: CampaignStatus::Unprocessed,
            created_at: now,
            updated_at: now,
        };

        if campaign.dust() > 0 {
            debug!(campaign = %campaign.id, dust = campaign.dust(), "dust stays at the source");
        }
        info!(
            campaign = %campaign.id,
            map = %map.id,
            tasks = campaign.task_count,
            policy = %policy,
            reverse,
            "planned campaign"
        );
        Ok(Plan { campaign, tasks })
    }
}

/// Amount on the edge into each non-root node when every leaf receives
/// `leaf_amount`.
fn equal_leaf_amounts(graph: &MapGraph, leaf_amount: u128) -> HashMap<NodeId, u128> {
    graph
        .leaves_under()
        .into_iter()
        .map(|(id, leaves)| (id, leaves * leaf_amount))
        .collect()
}

/// Amount on the edge into each non-root node when every node splits its
/// inbound amount evenly across its children.
fn equal_fanout_amounts(graph: &MapGraph, total: u128) -> Result<HashMap<NodeId, u128>> {
    let mut amounts = HashMap::new();
    for node in graph.breadth_first() {
        let inbound = if node.node_type == NodeType::Root {
            total
        } else {
            amounts.get(&node.id).copied().unwrap_or(0)
        };
        let children = graph.children_of(&node.id);
        if children.is_empty() {
            continue;
        }
        let share = inbound / children.len() as u128;
        if share == 0 {
            return Err(Error::AmountPolicy(format!(
                "{} base units at {} cannot be split across {} children",
                inbound,
                node.label,
                children.len()
            )));
        }
        for child in children {
            amounts.insert(child.id, share);
        }
    }
    Ok(amounts)
}

/// Non-root nodes from the deepest level up, breadth-first within a level.
fn collection_order(graph: &MapGraph) -> Vec<&Node> {
    let mut levels: Vec<Vec<&Node>> = Vec::new();
    for node in graph.breadth_first() {
        let depth = node.depth_id as usize;
        if levels.len() <= depth {
            levels.resize_with(depth + 1, Vec::new);
        }
        levels[depth].push(node);
    }
    levels.into_iter().skip(1).rev().flatten().collect()
}

/// Amount that leaves the source side: the root's outbound edges for
/// distribution, every leaf's outbound edge for collection.
fn source_outflow(
    graph: &MapGraph,
    amounts: &HashMap<NodeId, u128>,
    reverse: bool,
    leaf_amount: u128,
    leaf_count: u128,
) -> u128 {
    if reverse {
        return leaf_amount * leaf_count;
    }
    graph
        .root()
        .map(|root| {
            graph
                .children_of(&root.id)
                .iter()
                .map(|c| amounts.get(&c.id).copied().unwrap_or(0))
                .sum()
        })
        .unwrap_or(0)
}
