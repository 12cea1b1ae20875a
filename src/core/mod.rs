//! Core domain models for washmap.
//!
//! This module contains the fundamental data structures used throughout
//! the scheduler: the address tree of a distribution map, the campaign
//! aggregate and its transfer tasks, and the task dependency DAG.

pub mod amount;
pub mod campaign;
pub mod dag;
pub mod graph;
pub mod ids;
pub mod map;
pub mod task;

pub use campaign::{CampaignStatus, TaskCampaign};
pub use dag::TaskDAG;
pub use graph::MapGraph;
pub use ids::{CampaignId, MapId, NodeId, TaskId};
pub use map::{DistributionMap, Edge, MapParams, MapSpec, MapType, Node, NodeType, SplitPolicy};
pub use task::{Task, TaskStatus};
