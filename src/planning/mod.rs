//! Map construction and campaign planning.
//!
//! `GraphBuilder` turns a `MapSpec` into a validated address tree and
//! `TaskPlanner` expands that tree into one campaign of ordered transfer
//! tasks.

mod builder;
mod planner;

pub use builder::{
    node_count, AddressPool, AddressSource, GraphBuilder, SyntheticAddresses, DEFAULT_MAX_NODES,
};
pub use planner::{Plan, PlanRequest, TaskPlanner};
