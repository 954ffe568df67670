//! The path tuple: the unit of flow between operators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{NodeId, PropValue};
use crate::plan::OpId;

/// Value held at one operator's key inside a path tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum Slot {
    /// The node id this operator contributed.
    Node(NodeId),
    /// Properties loaded for a node, or a projected result record.
    Props(BTreeMap<String, PropValue>),
    /// A computed expression value.
    Value(PropValue),
}

/// Immutable record keyed by operator id. Operators never mutate a tuple
/// they received; they extend a copy and emit that.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathTuple {
    slots: BTreeMap<OpId, Slot>,
}

impl PathTuple {
    /// The empty tuple.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A copy of this tuple extended with one binding. The new binding
    /// replaces any existing slot under the same key.
    pub fn bind(&self, key: &OpId, slot: Slot) -> Self {
        let mut slots = self.slots.clone();
        slots.insert(key.clone(), slot);
        Self { slots }
    }

    /// Structural merge of two tuples; on conflict the right side wins.
    pub fn merge(&self, other: &PathTuple) -> Self {
        let mut slots = self.slots.clone();
        for (key, slot) in &other.slots {
            slots.insert(key.clone(), slot.clone());
        }
        Self { slots }
    }

    /// Whether the tuple carries any binding under `key`.
    pub fn contains(&self, key: &OpId) -> bool {
        self.slots.contains_key(key)
    }

    /// The raw slot under `key`.
    pub fn get(&self, key: &OpId) -> Option<&Slot> {
        self.slots.get(key)
    }

    /// The node id bound at `key`, if that slot holds one.
    pub fn node(&self, key: &OpId) -> Option<&NodeId> {
        match self.slots.get(key) {
            Some(Slot::Node(id)) => Some(id),
            _ => None,
        }
    }

    /// The property map bound at `key`, if that slot holds one.
    pub fn props(&self, key: &OpId) -> Option<&BTreeMap<String, PropValue>> {
        match self.slots.get(key) {
            Some(Slot::Props(map)) => Some(map),
            _ => None,
        }
    }

    /// The computed value bound at `key`, if that slot holds one.
    pub fn value(&self, key: &OpId) -> Option<&PropValue> {
        match self.slots.get(key) {
            Some(Slot::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the tuple has no bindings.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> OpId {
        OpId::new(s)
    }

    #[test]
    fn bind_leaves_the_original_untouched() {
        let base = PathTuple::empty();
        let bound = base.bind(&key("o0"), Slot::Node(NodeId::root()));
        assert!(base.is_empty());
        assert_eq!(bound.node(&key("o0")), Some(&NodeId::root()));
    }

    #[test]
    fn merge_prefers_the_right_side() {
        let left = PathTuple::empty()
            .bind(&key("o0"), Slot::Value(PropValue::Int(1)))
            .bind(&key("o1"), Slot::Value(PropValue::Int(2)));
        let right = PathTuple::empty().bind(&key("o1"), Slot::Value(PropValue::Int(9)));

        let merged = left.merge(&right);
        assert_eq!(merged.value(&key("o0")), Some(&PropValue::Int(1)));
        assert_eq!(merged.value(&key("o1")), Some(&PropValue::Int(9)));
        // the inputs are unchanged
        assert_eq!(left.value(&key("o1")), Some(&PropValue::Int(2)));
    }

    #[test]
    fn typed_accessors_reject_other_slot_shapes() {
        let pt = PathTuple::empty().bind(&key("o0"), Slot::Value(PropValue::Bool(true)));
        assert!(pt.node(&key("o0")).is_none());
        assert!(pt.props(&key("o0")).is_none());
        assert_eq!(pt.value(&key("o0")), Some(&PropValue::Bool(true)));
    }
}
