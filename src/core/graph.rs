//! Address tree of one distribution map.
//!
//! `MapGraph` keeps nodes in a petgraph arena with an id -> index map, so
//! parent and child lookups are adjacency walks rather than pointer chasing.
//! Edges point parent -> child regardless of the direction funds travel.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::ids::{MapId, NodeId};
use super::map::{Edge, Node, NodeType};
use crate::error::{Error, Result};

pub struct MapGraph {
    map_id: MapId,
    graph: DiGraph<Node, Edge>,
    node_index: HashMap<NodeId, NodeIndex>,
    root: Option<NodeIndex>,
}

impl MapGraph {
    pub fn new(map_id: MapId) -> Self {
        Self {
            map_id,
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            root: None,
        }
    }

    /// Rebuild a graph from persisted node and edge records.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the records do not form a valid tree.
    pub fn from_records(map_id: MapId, nodes: Vec<Node>, edges: &[Edge]) -> Result<Self> {
        let mut graph = Self::new(map_id);
        for node in nodes {
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(&edge.from_node, &edge.to_node)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn map_id(&self) -> MapId {
        self.map_id
    }

    /// Add a node. A second root or a node from another map is rejected.
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex> {
        if node.map_id != self.map_id {
            return Err(Error::Validation(format!(
                "node {} belongs to map {}, not {}",
                node.id, node.map_id, self.map_id
            )));
        }
        if let Some(&index) = self.node_index.get(&node.id) {
            return Ok(index);
        }
        let is_root = node.node_type == NodeType::Root;
        if is_root && self.root.is_some() {
            return Err(Error::Validation(format!(
                "map {} already has a root node",
                self.map_id
            )));
        }

        let id = node.id;
        let index = self.graph.add_node(node);
        self.node_index.insert(id, index);
        if is_root {
            self.root = Some(index);
        }
        Ok(index)
    }

    /// Add a parent -> child edge.
    ///
    /// # Errors
    /// Returns an error if either node is unknown, the child already has a
    /// parent, or the depths are not consecutive. Strictly increasing depth
    /// rules out cycles.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if self
            .graph
            .neighbors_directed(to_index, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(Error::Validation(format!(
                "node {} already has a parent",
                to
            )));
        }

        let from_depth = self.graph[from_index].depth_id;
        let to_depth = self.graph[to_index].depth_id;
        if to_depth != from_depth + 1 {
            return Err(Error::Validation(format!(
                "edge {} -> {} joins depth {} to depth {}",
                from, to, from_depth, to_depth
            )));
        }

        self.graph.add_edge(
            from_index,
            to_index,
            Edge {
                map_id: self.map_id,
                from_node: *from,
                to_node: *to,
            },
        );
        Ok(())
    }

    fn index_of(&self, id: &NodeId) -> Result<NodeIndex> {
        self.node_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("node {} not found in map", id)))
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.node_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.and_then(|index| self.graph.node_weight(index))
    }

    /// Children in insertion order.
    pub fn children_of(&self, id: &NodeId) -> Vec<&Node> {
        let Some(&index) = self.node_index.get(id) else {
            return Vec::new();
        };
        // petgraph yields neighbors newest-first.
        let mut children: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        children.reverse();
        children
            .into_iter()
            .filter_map(|child| self.graph.node_weight(child))
            .collect()
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&Node> {
        let index = self.node_index.get(id)?;
        self.graph
            .neighbors_directed(*index, Direction::Incoming)
            .next()
            .and_then(|parent| self.graph.node_weight(parent))
    }

    pub fn depth_of(&self, id: &NodeId) -> Option<u32> {
        self.node(id).map(|n| n.depth_id)
    }

    pub fn nodes(&self) -> Vec<&Node> {
        self.graph.node_weights().collect()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.graph.edge_weights().copied().collect()
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.breadth_first()
            .into_iter()
            .filter(|n| n.node_type == NodeType::Leaf)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Nodes in breadth-first order from the root, children visited in
    /// insertion order. Deterministic for a given build.
    pub fn breadth_first(&self) -> Vec<&Node> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut queue = VecDeque::from([root]);
        while let Some(index) = queue.pop_front() {
            let node = &self.graph[index];
            order.push(node);
            for child in self.children_of(&node.id) {
                queue.push_back(self.node_index[&child.id]);
            }
        }
        order
    }

    /// Number of leaves in the subtree rooted at each node.
    pub fn leaves_under(&self) -> HashMap<NodeId, u128> {
        let mut counts: HashMap<NodeId, u128> = HashMap::new();
        for node in self.breadth_first().into_iter().rev() {
            let count = if node.node_type == NodeType::Leaf {
                1
            } else {
                self.children_of(&node.id)
                    .iter()
                    .map(|c| counts.get(&c.id).copied().unwrap_or(0))
                    .sum()
            };
            counts.insert(node.id, count);
        }
        counts
    }

    /// Check the tree invariants: one root at depth 0, every other node
    /// reachable with exactly one parent, depth equal to distance from the
    /// root, and node types consistent with position.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let root = self
            .root()
            .ok_or_else(|| Error::Validation(format!("map {} has no root node", self.map_id)))?;
        if root.depth_id != 0 {
            return Err(Error::Validation(format!(
                "root {} has depth {}",
                root.id, root.depth_id
            )));
        }

        let reachable = self.breadth_first();
        if reachable.len() != self.node_count() {
            return Err(Error::Validation(format!(
                "{} of {} nodes are unreachable from the root",
                self.node_count() - reachable.len(),
                self.node_count()
            )));
        }

        for node in reachable {
            let has_children = !self.children_of(&node.id).is_empty();
            let expected = match (node.depth_id, has_children) {
                (0, _) => NodeType::Root,
                (_, true) => NodeType::Intermediate,
                (_, false) => NodeType::Leaf,
            };
            if node.node_type != expected {
                return Err(Error::Validation(format!(
                    "node {} is {} but sits where a {} belongs",
                    node.label, node.node_type, expected
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MapGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapGraph")
            .field("map_id", &self.map_id)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
