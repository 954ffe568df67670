//! Read surface over the node store, plus the in-memory store used by the
//! engine and its tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PlasmaError, Result};
use crate::model::{EdgeProps, Node, NodeId, PropValue, LABEL_PROP};

/// Edge filter applied during traversal. Serializable so it can travel
/// inside a transported plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum EdgePredicate {
    /// Matches every edge.
    Any,
    /// Matches edges whose label equals the given symbol.
    Label(String),
    /// Matches edges whose label matches the given regular expression.
    Pattern(String),
    /// Matches edges whose properties contain every listed key/value pair.
    Where(BTreeMap<String, PropValue>),
}

impl EdgePredicate {
    /// Tests the predicate against a single edge-property mapping.
    pub fn matches(&self, edge: &EdgeProps) -> Result<bool> {
        match self {
            EdgePredicate::Any => Ok(true),
            EdgePredicate::Label(label) => Ok(edge
                .get(LABEL_PROP)
                .and_then(PropValue::as_str)
                .is_some_and(|l| l == label)),
            EdgePredicate::Pattern(pattern) => {
                let re = Regex::new(pattern).map_err(|err| {
                    PlasmaError::PlanInvalid(format!("bad edge pattern '{pattern}': {err}"))
                })?;
                Ok(edge
                    .get(LABEL_PROP)
                    .and_then(PropValue::as_str)
                    .is_some_and(|l| re.is_match(l)))
            }
            EdgePredicate::Where(wanted) => {
                Ok(wanted.iter().all(|(k, v)| edge.get(k) == Some(v)))
            }
        }
    }
}

/// Read-only view of a peer's graph. Writes are the store's business; the
/// query engine never mutates the graph.
pub trait GraphStore: Send + Sync {
    /// Fetches a node by id.
    fn find_node(&self, id: &NodeId) -> Option<Node>;

    /// Outgoing edges of a node, filtered by the predicate.
    fn edges(&self, id: &NodeId, pred: &EdgePredicate) -> Result<BTreeMap<NodeId, EdgeProps>>;

    /// Whether the node is a proxy for a node on another peer.
    fn is_proxy(&self, id: &NodeId) -> bool;
}

/// In-memory node store. Every peer owns one; the seeding methods exist
/// for embedders and tests, not for the engine.
pub struct MemoryGraph {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl MemoryGraph {
    /// Creates a graph holding the reserved root and meta nodes.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::root(), Node::new(NodeId::root()));
        nodes.insert(NodeId::meta(), Node::new(NodeId::meta()));
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Inserts a node, returning its id.
    pub fn add_node(&self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.write().insert(id.clone(), node);
        id
    }

    /// Inserts a fresh node with the given properties, returning its id.
    pub fn add(&self, props: &[(&str, PropValue)]) -> NodeId {
        let mut node = Node::new(NodeId::fresh());
        for (name, value) in props {
            node.set(*name, value.clone());
        }
        self.add_node(node)
    }

    /// Links `src` to `dst` with a labelled edge.
    pub fn link(&self, src: &NodeId, dst: &NodeId, label: &str) -> Result<()> {
        let mut edge = EdgeProps::new();
        edge.insert(LABEL_PROP.to_owned(), PropValue::from(label));
        self.link_with(src, dst, edge)
    }

    /// Links `src` to `dst` with explicit edge properties.
    pub fn link_with(&self, src: &NodeId, dst: &NodeId, edge: EdgeProps) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(src)
            .ok_or_else(|| PlasmaError::GraphMissing(src.to_string()))?;
        node.add_edge(dst, edge);
        Ok(())
    }

    /// Number of nodes currently stored.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the store holds no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemoryGraph {
    fn find_node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    fn edges(&self, id: &NodeId, pred: &EdgePredicate) -> Result<BTreeMap<NodeId, EdgeProps>> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(id)
            .ok_or_else(|| PlasmaError::GraphMissing(id.to_string()))?;
        let mut out = BTreeMap::new();
        for (target, edge) in node.edges() {
            if pred.matches(&edge)? {
                out.insert(target, edge);
            }
        }
        Ok(out)
    }

    fn is_proxy(&self, id: &NodeId) -> bool {
        self.nodes
            .read()
            .get(id)
            .is_some_and(|node| node.proxy().is_some())
    }
}
