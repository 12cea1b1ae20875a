//! Distribution map records: the map itself, its nodes and its edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MapId, NodeId};

/// Direction funds travel through a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    /// Root funds its children, down to the leaves.
    #[default]
    FanOut,
    /// Leaves send back toward the root (collection pass).
    FanIn,
}

impl MapType {
    /// Whether tasks planned from this map flow leaf -> root.
    pub fn is_reverse(&self) -> bool {
        matches!(self, MapType::FanIn)
    }
}

impl std::fmt::Display for MapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapType::FanOut => write!(f, "fan_out"),
            MapType::FanIn => write!(f, "fan_in"),
        }
    }
}

/// How a campaign total is divided across the edges of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Every leaf receives the same amount; inner edges carry the sum
    /// of the leaves below them.
    #[default]
    EqualLeaf,
    /// Every node splits its inbound amount evenly across its children.
    EqualFanout,
}

impl std::fmt::Display for SplitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitPolicy::EqualLeaf => write!(f, "equal_leaf"),
            SplitPolicy::EqualFanout => write!(f, "equal_fanout"),
        }
    }
}

impl std::str::FromStr for SplitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "equal_leaf" => Ok(SplitPolicy::EqualLeaf),
            "equal_fanout" => Ok(SplitPolicy::EqualFanout),
            other => Err(format!("unknown split policy: {}", other)),
        }
    }
}

/// Structural parameters of a map. Immutable once the map exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapParams {
    /// Children per non-leaf node.
    pub branching_factor: u32,
    /// Distance from root to every leaf.
    pub depth: u32,
    /// Split policy used when a plan request does not override it.
    #[serde(default)]
    pub split_policy: SplitPolicy,
    /// Plan the collection pass (leaf -> root) instead of distribution.
    #[serde(default)]
    pub reverse: bool,
}

/// Declarative input for building a map, usually read from a TOML file.
///
/// ```toml
/// project = "alpha"
/// name = "wash-1"
/// root_address = "RootWallet111"
/// branching_factor = 2
/// depth = 2
/// split_policy = "equal_leaf"
/// reverse = false
/// addresses = ["A1", "A2", "B1", "B2", "B3", "B4"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSpec {
    /// Owning project reference in the outer CRUD layer.
    pub project: String,
    /// Human-readable map name.
    #[serde(default)]
    pub name: String,
    /// Address of the root wallet.
    pub root_address: String,
    #[serde(flatten)]
    pub params: MapParams,
    /// Addresses for non-root nodes in breadth-first order. When empty the
    /// builder falls back to synthetic labels.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl MapSpec {
    /// Create a spec with synthetic addresses and the default split policy.
    pub fn new(project: &str, root_address: &str, branching_factor: u32, depth: u32) -> Self {
        Self {
            project: project.to_string(),
            name: String::new(),
            root_address: root_address.to_string(),
            params: MapParams {
                branching_factor,
                depth,
                split_policy: SplitPolicy::default(),
                reverse: false,
            },
            addresses: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: SplitPolicy) -> Self {
        self.params.split_policy = policy;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.params.reverse = true;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }
}

/// One campaign's graph definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMap {
    pub id: MapId,
    pub project: String,
    pub name: String,
    pub map_type: MapType,
    pub params: MapParams,
    pub root_address: String,
    pub created_at: DateTime<Utc>,
}

impl DistributionMap {
    pub fn from_spec(spec: &MapSpec) -> Self {
        let map_type = if spec.params.reverse {
            MapType::FanIn
        } else {
            MapType::FanOut
        };
        Self {
            id: MapId::new(),
            project: spec.project.clone(),
            name: spec.name.clone(),
            map_type,
            params: spec.params.clone(),
            root_address: spec.root_address.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Role of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Intermediate,
    Leaf,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Root => write!(f, "root"),
            NodeType::Intermediate => write!(f, "intermediate"),
            NodeType::Leaf => write!(f, "leaf"),
        }
    }
}

/// A wallet address within a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub map_id: MapId,
    pub label: String,
    pub address: String,
    pub node_type: NodeType,
    /// Branch identifier: 0 for the root, `1..=b` for each root child and
    /// inherited by every descendant of that child.
    pub chain_id: u32,
    /// Distance from the root.
    pub depth_id: u32,
}

/// Directed parent -> child relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub map_id: MapId,
    pub from_node: NodeId,
    pub to_node: NodeId,
}
