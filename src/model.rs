//! Node identifiers, property values, and the node map itself.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by every node identifier.
pub const ID_PREFIX: &str = "UUID:";

/// Reserved identifier of a peer's graph root.
pub const ROOT_ID: &str = "UUID:ROOT";

/// Reserved identifier of a peer's metadata anchor.
pub const META_ID: &str = "UUID:META";

/// Property name that carries a node's identifier.
pub const ID_PROP: &str = "id";

/// Property name that marks a proxy node; its value is a peer URL string.
pub const PROXY_PROP: &str = "proxy";

/// Property name carrying the remote node id a proxy points at. When
/// absent, the proxy node's own id names the remote node.
pub const PROXY_TARGET_PROP: &str = "proxy-id";

/// Property name holding a node's outgoing edge map.
pub const EDGES_PROP: &str = "edges";

/// Mandatory edge property naming the edge's label.
pub const LABEL_PROP: &str = "label";

/// Opaque node identifier: `"UUID:"` followed by a canonical UUID (or one
/// of the reserved words `ROOT` / `META`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an already-prefixed identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved root identifier.
    pub fn root() -> Self {
        Self(ROOT_ID.to_owned())
    }

    /// The reserved metadata identifier.
    pub fn meta() -> Self {
        Self(META_ID.to_owned())
    }

    /// Mints a fresh identifier from a random v4 UUID.
    pub fn fresh() -> Self {
        Self(format!("{ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// The full identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Four characters past the prefix, for log lines only.
    pub fn short(&self) -> &str {
        let tail = self.0.strip_prefix(ID_PREFIX).unwrap_or(&self.0);
        &tail[..tail.len().min(4)]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Property value attached to nodes and edges, tagged so the wire format
/// stays unambiguous across peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum PropValue {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    Str(String),
    /// Ordered list of values.
    List(Vec<PropValue>),
    /// Nested string-keyed mapping.
    Map(BTreeMap<String, PropValue>),
}

impl PropValue {
    /// Partial ordering used by sort and min/max operators. Values of
    /// different shapes are unordered; ints and floats compare numerically.
    pub fn partial_cmp_value(&self, other: &PropValue) -> Option<Ordering> {
        match (self, other) {
            (PropValue::Bool(a), PropValue::Bool(b)) => a.partial_cmp(b),
            (PropValue::Int(a), PropValue::Int(b)) => a.partial_cmp(b),
            (PropValue::Float(a), PropValue::Float(b)) => a.partial_cmp(b),
            (PropValue::Int(a), PropValue::Float(b)) => (*a as f64).partial_cmp(b),
            (PropValue::Float(a), PropValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (PropValue::Str(a), PropValue::Str(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Int(v) => Some(*v as f64),
            PropValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&NodeId> for PropValue {
    fn from(value: &NodeId) -> Self {
        PropValue::Str(value.as_str().to_owned())
    }
}

/// Edge-property mapping; always contains [`LABEL_PROP`].
pub type EdgeProps = BTreeMap<String, PropValue>;

/// A node is a property mapping with a mandatory `id`. Outgoing edges live
/// in the `edges` property as a target-id to edge-props mapping; a `proxy`
/// property marks the node as a placeholder for a node on another peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node {
    props: BTreeMap<String, PropValue>,
}

impl Node {
    /// Creates a node holding only its identifier.
    pub fn new(id: NodeId) -> Self {
        let mut props = BTreeMap::new();
        props.insert(ID_PROP.to_owned(), PropValue::from(&id));
        Self { props }
    }

    /// Extends the node with a property, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    /// The node's identifier.
    pub fn id(&self) -> NodeId {
        match self.props.get(ID_PROP) {
            Some(PropValue::Str(id)) => NodeId::new(id.clone()),
            _ => NodeId::new(String::new()),
        }
    }

    /// Looks up a property by name.
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.props.get(name)
    }

    /// Sets a property in place. The engine never calls this; it exists
    /// for graph seeding.
    pub fn set(&mut self, name: impl Into<String>, value: PropValue) {
        self.props.insert(name.into(), value);
    }

    /// The full property mapping.
    pub fn props(&self) -> &BTreeMap<String, PropValue> {
        &self.props
    }

    /// Peer URL string if this node is a proxy.
    pub fn proxy(&self) -> Option<&str> {
        match self.props.get(PROXY_PROP) {
            Some(PropValue::Str(url)) => Some(url),
            _ => None,
        }
    }

    /// The remote node this proxy stands for: the `proxy-id` property when
    /// present, otherwise the node's own id.
    pub fn proxy_target(&self) -> NodeId {
        match self.props.get(PROXY_TARGET_PROP) {
            Some(PropValue::Str(id)) => NodeId::new(id.clone()),
            _ => self.id(),
        }
    }

    /// Outgoing edges as a target-id to edge-props mapping.
    pub fn edges(&self) -> BTreeMap<NodeId, EdgeProps> {
        let mut out = BTreeMap::new();
        if let Some(PropValue::Map(targets)) = self.props.get(EDGES_PROP) {
            for (target, props) in targets {
                if let PropValue::Map(edge) = props {
                    out.insert(NodeId::new(target.clone()), edge.clone());
                }
            }
        }
        out
    }

    /// Adds an outgoing edge. Graph seeding only.
    pub fn add_edge(&mut self, target: &NodeId, edge: EdgeProps) {
        let entry = self
            .props
            .entry(EDGES_PROP.to_owned())
            .or_insert_with(|| PropValue::Map(BTreeMap::new()));
        if let PropValue::Map(targets) = entry {
            targets.insert(target.as_str().to_owned(), PropValue::Map(edge));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_takes_four_chars_after_prefix() {
        let id = NodeId::new("UUID:deadbeef-0000");
        assert_eq!(id.short(), "dead");
        assert_eq!(NodeId::root().short(), "ROOT");
    }

    #[test]
    fn fresh_ids_are_prefixed_and_distinct() {
        let a = NodeId::fresh();
        let b = NodeId::fresh();
        assert!(a.as_str().starts_with(ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn proxy_target_defaults_to_own_id() {
        let id = NodeId::fresh();
        let plain = Node::new(id.clone()).with(PROXY_PROP, "plasma://other:4242");
        assert_eq!(plain.proxy_target(), id);
        assert_eq!(plain.proxy(), Some("plasma://other:4242"));

        let aimed = Node::new(NodeId::fresh())
            .with(PROXY_PROP, "plasma://other:4242")
            .with(PROXY_TARGET_PROP, ROOT_ID);
        assert_eq!(aimed.proxy_target(), NodeId::root());
    }

    #[test]
    fn edges_round_trip_through_props() {
        let target = NodeId::fresh();
        let mut node = Node::new(NodeId::root());
        let mut edge = EdgeProps::new();
        edge.insert(LABEL_PROP.to_owned(), PropValue::from("music"));
        node.add_edge(&target, edge);

        let edges = node.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(
            edges.get(&target).and_then(|e| e.get(LABEL_PROP)),
            Some(&PropValue::from("music"))
        );
    }

    #[test]
    fn mixed_numeric_ordering() {
        assert_eq!(
            PropValue::Int(1).partial_cmp_value(&PropValue::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            PropValue::from("a").partial_cmp_value(&PropValue::Int(1)),
            None
        );
    }
}
