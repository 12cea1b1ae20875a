//! Graph builder: expands a declarative map specification into a tree of
//! nodes and edges.
//!
//! The root sits at depth 0 and every non-leaf node at depth `k < d` gets
//! exactly `b` children at depth `k + 1`. Nodes are created breadth-first,
//! so an explicit address list is consumed level by level, left to right.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info};

use crate::core::{DistributionMap, MapGraph, MapSpec, Node, NodeId, NodeType};
use crate::error::{Error, Result};

/// Default safety limit on the number of nodes a single map may hold.
pub const DEFAULT_MAX_NODES: u64 = 100_000;

/// Supplies wallet addresses for non-root nodes.
pub trait AddressSource {
    /// Return the address for the node with the given label.
    fn next_address(&mut self, label: &str) -> Result<String>;
}

/// Explicit, ordered address list.
#[derive(Debug, Clone)]
pub struct AddressPool {
    addresses: VecDeque<String>,
}

impl AddressPool {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses: addresses.into(),
        }
    }

    /// Addresses not yet handed out.
    pub fn remaining(&self) -> usize {
        self.addresses.len()
    }
}

impl AddressSource for AddressPool {
    fn next_address(&mut self, label: &str) -> Result<String> {
        self.addresses.pop_front().ok_or_else(|| {
            Error::InvalidSpecification(format!("address list exhausted at node {}", label))
        })
    }
}

/// Deterministic labels standing in for real wallets during rehearsals.
#[derive(Debug, Clone)]
pub struct SyntheticAddresses {
    prefix: String,
}

impl SyntheticAddresses {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl AddressSource for SyntheticAddresses {
    fn next_address(&mut self, label: &str) -> Result<String> {
        Ok(format!("{}-{}", self.prefix, label))
    }
}

/// Number of nodes in a complete tree with branching factor `b` and depth
/// `d`, or `None` on overflow.
pub fn node_count(branching_factor: u32, depth: u32) -> Option<u64> {
    let b = u64::from(branching_factor);
    let mut total: u64 = 0;
    let mut level: u64 = 1;
    for _ in 0..=depth {
        total = total.checked_add(level)?;
        level = level.checked_mul(b)?;
    }
    Some(total)
}

/// Builds maps from specifications.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    max_nodes: u64,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES)
    }
}

impl GraphBuilder {
    pub fn new(max_nodes: u64) -> Self {
        Self { max_nodes }
    }

    /// Build a map using the spec's address list, or synthetic addresses
    /// when the list is empty.
    pub fn build(&self, spec: &MapSpec) -> Result<(DistributionMap, MapGraph)> {
        let map = DistributionMap::from_spec(spec);
        if spec.addresses.is_empty() {
            let mut source = SyntheticAddresses::new(&map.id.short());
            self.build_with(map, spec, &mut source)
        } else {
            let mut pool = AddressPool::new(spec.addresses.clone());
            let built = self.build_with(map, spec, &mut pool)?;
            if pool.remaining() > 0 {
                debug!(
                    unused = pool.remaining(),
                    "address list longer than the map needs"
                );
            }
            Ok(built)
        }
    }

    /// Build a map pulling non-root addresses from `source`.
    ///
    /// # Errors
    /// Returns `Error::InvalidSpecification` if:
    /// - `branching_factor` or `depth` is below 1
    /// - The root address is empty
    /// - The node count would exceed the safety limit
    /// - The source runs out of addresses or hands out a duplicate
    pub fn build_with(
        &self,
        map: DistributionMap,
        spec: &MapSpec,
        source: &mut dyn AddressSource,
    ) -> Result<(DistributionMap, MapGraph)> {
        let params = &spec.params;
        if params.branching_factor < 1 {
            return Err(Error::InvalidSpecification(
                "branching factor must be at least 1".to_string(),
            ));
        }
        if params.depth < 1 {
            return Err(Error::InvalidSpecification(
                "depth must be at least 1".to_string(),
            ));
        }
        let root_address = spec.root_address.trim();
        if root_address.is_empty() {
            return Err(Error::InvalidSpecification(
                "root address is empty".to_string(),
            ));
        }
        let total = node_count(params.branching_factor, params.depth)
            .filter(|n| *n <= self.max_nodes)
            .ok_or_else(|| {
                Error::InvalidSpecification(format!(
                    "b={} d={} exceeds the limit of {} nodes",
                    params.branching_factor, params.depth, self.max_nodes
                ))
            })?;

        let mut graph = MapGraph::new(map.id);
        let mut seen: HashSet<String> = HashSet::with_capacity(total as usize);
        seen.insert(root_address.to_string());

        let root = Node {
            id: NodeId::new(),
            map_id: map.id,
            label: "root".to_string(),
            address: root_address.to_string(),
            node_type: NodeType::Root,
            chain_id: 0,
            depth_id: 0,
        };
        let mut queue = VecDeque::from([(root.id, String::new(), 0u32, 0u32)]);
        graph.add_node(root)?;

        while let Some((parent_id, parent_path, chain_id, depth)) = queue.pop_front() {
            if depth == params.depth {
                continue;
            }
            let child_depth = depth + 1;
            for i in 1..=params.branching_factor {
                let label = if parent_path.is_empty() {
                    i.to_string()
                } else {
                    format!("{}.{}", parent_path, i)
                };
                let address = source.next_address(&label)?;
                if !seen.insert(address.clone()) {
                    return Err(Error::InvalidSpecification(format!(
                        "address {} is used more than once",
                        address
                    )));
                }
                let node_type = if child_depth == params.depth {
                    NodeType::Leaf
                } else {
                    NodeType::Intermediate
                };
                let child = Node {
                    id: NodeId::new(),
                    map_id: map.id,
                    label: label.clone(),
                    address,
                    node_type,
                    chain_id: if depth == 0 { i } else { chain_id },
                    depth_id: child_depth,
                };
                let child_chain = child.chain_id;
                let child_id = child.id;
                graph.add_node(child)?;
                graph.add_edge(&parent_id, &child_id)?;
                queue.push_back((child_id, label, child_chain, child_depth));
            }
        }

        info!(
            map = %map.id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            branching_factor = params.branching_factor,
            depth = params.depth,
            "built distribution map"
        );
        Ok((map, graph))
    }
}
