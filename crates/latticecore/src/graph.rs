//! Validated, acyclic view of a workflow.
//!
//! The graph is built incrementally with [`Graph::add_node`] and
//! [`Graph::add_edge`]; every edge insertion runs a reachability check from
//! the target back to the source, so a cycle is rejected at the edge that
//! would close it. Once handed to the runtime the graph is never mutated.

use crate::{Connection, GraphError, NodeId, NodeSpec, Workflow};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: DiGraph<NodeId, usize>,
    index: HashMap<NodeId, NodeIndex>,
    nodes: Vec<NodeSpec>,
    order: HashMap<NodeId, usize>,
    edges: Vec<Connection>,
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from a workflow definition.
    ///
    /// Node definition order is preserved and used as the scheduling
    /// tie-break.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        let mut graph = Graph::new();
        for node in &workflow.nodes {
            graph.add_node(node.clone())?;
        }
        for connection in &workflow.connections {
            graph.add_edge(connection.clone())?;
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let id = spec.id;
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let idx = self.graph.add_node(id);
        self.index.insert(id, idx);
        self.order.insert(id, self.nodes.len());
        self.nodes.push(spec);
        Ok(id)
    }

    pub fn add_edge(&mut self, connection: Connection) -> Result<(), GraphError> {
        let from = self
            .node(connection.from_node)
            .ok_or(GraphError::NodeNotFound(connection.from_node))?;
        if from.output_index(&connection.from_port).is_none() {
            return Err(GraphError::UnknownOutputPort {
                node: connection.from_node,
                port: connection.from_port.clone(),
            });
        }
        let to = self
            .node(connection.to_node)
            .ok_or(GraphError::NodeNotFound(connection.to_node))?;
        if to.input_index(&connection.to_port).is_none() {
            return Err(GraphError::UnknownInputPort {
                node: connection.to_node,
                port: connection.to_port.clone(),
            });
        }

        let from_idx = self.index[&connection.from_node];
        let to_idx = self.index[&connection.to_node];
        // The new edge closes a cycle iff the source is already reachable
        // from the target.
        if has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(GraphError::Cycle {
                from: connection.from_node,
                to: connection.to_node,
            });
        }

        let edge_idx = self.edges.len();
        self.graph.add_edge(from_idx, to_idx, edge_idx);
        self.incoming
            .entry(connection.to_node)
            .or_default()
            .push(edge_idx);
        self.outgoing
            .entry(connection.from_node)
            .or_default()
            .push(edge_idx);
        self.edges.push(connection);
        Ok(())
    }

    /// Checks that need the complete edge set.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            if self.is_source(node.id) {
                continue;
            }
            for port in node.inputs.iter().filter(|p| p.required) {
                let connected = self
                    .incoming(node.id)
                    .any(|conn| conn.to_port == port.name);
                if !connected {
                    return Err(GraphError::UnconnectedRequiredPort {
                        node: node.id,
                        port: port.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.order.get(&id).map(|&pos| &self.nodes[pos])
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Connection] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of a node in definition order.
    pub fn definition_order(&self, id: NodeId) -> Option<usize> {
        self.order.get(&id).copied()
    }

    /// Incoming connections in insertion order.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Connection> {
        self.incoming
            .get(&id)
            .into_iter()
            .flatten()
            .map(move |&e| &self.edges[e])
    }

    /// Outgoing connections in insertion order.
    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Connection> {
        self.outgoing
            .get(&id)
            .into_iter()
            .flatten()
            .map(move |&e| &self.edges[e])
    }

    pub fn is_source(&self, id: NodeId) -> bool {
        self.incoming.get(&id).map_or(true, |edges| edges.is_empty())
    }

    /// Incoming connections grouped by the target's declared input ports.
    pub fn port_sources(&self, id: NodeId) -> Vec<Vec<&Connection>> {
        let Some(spec) = self.node(id) else {
            return Vec::new();
        };
        spec.inputs
            .iter()
            .map(|port| {
                self.incoming(id)
                    .filter(|conn| conn.to_port == port.name)
                    .collect()
            })
            .collect()
    }

    /// Nodes not yet in `completed` whose every upstream producer is.
    ///
    /// Source nodes qualify immediately. The result follows definition order.
    /// Whether a candidate actually runs or is skipped depends on the outcome
    /// of its producers and is decided by the scheduler.
    pub fn ready_nodes(&self, completed: &HashSet<NodeId>) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !completed.contains(id))
            .filter(|&id| self.incoming(id).all(|conn| completed.contains(&conn.from_node)))
            .collect()
    }

    /// A topological order of all nodes.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx]).collect())
            .map_err(|cycle| {
                let id = self.graph[cycle.node_id()];
                GraphError::Cycle { from: id, to: id }
            })
    }
}
