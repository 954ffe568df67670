//! The serializable operator DAG a query lowers into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PlasmaError, Result};
use crate::expr::Expr;
use crate::graph::EdgePredicate;
use crate::model::PropValue;

/// Path-variable name bound to a plan's seed parameter.
pub const ROOT_PARAM: &str = "ROOT-ID";

/// Stable operator identifier assigned at plan time. Path-tuple keys are
/// these identifiers, so a transported sub-plan keeps them verbatim.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sort direction for the sort operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One projected field of the result record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectField {
    /// Path-variable name the field is published under.
    pub var: String,
    /// Operator slot holding the variable's node id.
    pub key: OpId,
    /// Property operator slot the listed properties were loaded into.
    pub props_key: Option<OpId>,
    /// Properties to project; empty projects the bare node id.
    pub props: Vec<String>,
}

/// Operator descriptor. The twelve operator families of the runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OpKind {
    /// Yields the seed value bound to `name`, once per element, then closes.
    Parameter {
        /// Path-variable name the seed is looked up under.
        name: String,
    },
    /// Follows matching edges from the node bound at `src`.
    Traverse {
        /// Operator slot holding the source node of each hop.
        src: OpId,
        /// Edge filter applied to outgoing edges.
        pred: EdgePredicate,
    },
    /// Feeds the left dep's output into the right dep's input and forwards
    /// the right dep's output.
    Join,
    /// Ensures the listed properties of the node at `key` ride the tuple.
    Property {
        /// Operator slot holding the node whose properties are wanted.
        key: OpId,
        /// Property names to load.
        props: Vec<String>,
    },
    /// Retains tuples for which the predicate holds.
    Select {
        /// Operator slot the predicate tests.
        key: OpId,
        /// Boolean expression over tuple bindings.
        pred: Expr,
    },
    /// Extends each tuple with a computed value bound to this operator.
    Expression {
        /// Expression evaluated over tuple bindings.
        expr: Expr,
    },
    /// Converts tuples into result records.
    Project {
        /// Fields of the output record.
        fields: Vec<ProjectField>,
    },
    /// Buffers everything, then re-emits the buffer on input close.
    Aggregate,
    /// Aggregate with a comparator over a loaded property.
    Sort {
        /// Property operator slot holding the sort property.
        key: OpId,
        /// Property name to order by.
        prop: String,
        /// Sort direction.
        order: SortOrder,
    },
    /// Emits the tuple with the smallest value of the keyed property.
    Min {
        /// Property operator slot holding the compared property.
        key: OpId,
        /// Property name to compare.
        prop: String,
    },
    /// Emits the tuple with the largest value of the keyed property.
    Max {
        /// Property operator slot holding the compared property.
        key: OpId,
        /// Property name to compare.
        prop: String,
    },
    /// Emits the numeric mean of the keyed property over all tuples.
    Average {
        /// Property operator slot holding the averaged property.
        key: OpId,
        /// Property name to average.
        prop: String,
    },
    /// Emits the number of buffered tuples.
    Count,
    /// Emits a uniform random sample of `n` buffered tuples.
    Choose {
        /// Sample size.
        n: usize,
    },
    /// Stream-side limit: forwards the first `n` tuples, then closes.
    Limit {
        /// Number of tuples to pass.
        n: usize,
    },
    /// Forwards tuples onto a registered network channel.
    Send {
        /// Name of the destination channel.
        dest: String,
    },
    /// Merges the left dep's output with remote sub-query streams.
    Receive {
        /// Inactivity timeout applied to each remote channel.
        timeout_ms: u64,
    },
}

impl OpKind {
    /// Short name used in logs and fallback result records.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter { .. } => "parameter",
            OpKind::Traverse { .. } => "traverse",
            OpKind::Join => "join",
            OpKind::Property { .. } => "property",
            OpKind::Select { .. } => "select",
            OpKind::Expression { .. } => "expression",
            OpKind::Project { .. } => "project",
            OpKind::Aggregate => "aggregate",
            OpKind::Sort { .. } => "sort",
            OpKind::Min { .. } => "min",
            OpKind::Max { .. } => "max",
            OpKind::Average { .. } => "average",
            OpKind::Count => "count",
            OpKind::Choose { .. } => "choose",
            OpKind::Limit { .. } => "limit",
            OpKind::Send { .. } => "send",
            OpKind::Receive { .. } => "receive",
        }
    }
}

/// A node of the plan DAG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    /// Stable operator identifier.
    pub id: OpId,
    /// Operator descriptor.
    pub kind: OpKind,
    /// Upstream operator ids; a join lists `[left, right]`.
    pub deps: Vec<OpId>,
}

/// How a plan is driven.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanKind {
    /// Single-round execution.
    Query,
    /// Multi-round execution gated by a per-tuple predicate.
    RecurQuery,
    /// Fixed number of rounds threaded through root rebinding.
    IterNQuery,
}

/// Serializable query plan. Plans are values: one query each, no
/// references, no cycles, transportable verbatim between peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Query identity, shared by every sub-plan cut from this plan.
    pub qid: String,
    /// Operator table keyed by id.
    pub ops: BTreeMap<OpId, OpNode>,
    /// Terminal operator whose output is the query result.
    pub root: OpId,
    /// Path-variable name to parameter-operator id.
    pub params: BTreeMap<String, OpId>,
    /// Path-variable symbol to the operator slot holding its node.
    pub pbind: BTreeMap<String, OpId>,
    /// Original filter expressions, kept for transport and debugging.
    pub filters: Vec<Expr>,
    /// Original projection list, if any.
    pub projection: Option<Vec<(String, Vec<String>)>>,
    /// Originating peer of a recursive plan.
    pub src_url: Option<String>,
    /// Hops-to-live budget, decremented at each remote hop or round.
    pub htl: u32,
    /// Execution mode.
    pub kind: PlanKind,
    /// Remaining rounds of an iter-n plan.
    pub iter_n: u32,
    /// Per-tuple recursion predicate of a recur plan.
    pub pred: Option<Expr>,
    /// Seed values shipped with the plan; execution-time parameters
    /// override these. Iterated plans rebind their root seed here.
    pub seeds: BTreeMap<String, PropValue>,
}

impl Plan {
    /// An empty single-round plan with a fresh query id.
    pub fn new(htl: u32) -> Self {
        Self {
            qid: Uuid::new_v4().to_string(),
            ops: BTreeMap::new(),
            root: OpId::new(""),
            params: BTreeMap::new(),
            pbind: BTreeMap::new(),
            filters: Vec::new(),
            projection: None,
            src_url: None,
            htl,
            kind: PlanKind::Query,
            iter_n: 0,
            pred: None,
            seeds: BTreeMap::new(),
        }
    }

    /// Looks up an operator by id.
    pub fn op(&self, id: &OpId) -> Option<&OpNode> {
        self.ops.get(id)
    }

    /// The first receive operator on the spine, if the plan has one.
    pub fn receive_op(&self) -> Option<&OpId> {
        self.ops
            .values()
            .find(|op| matches!(op.kind, OpKind::Receive { .. }))
            .map(|op| &op.id)
    }

    /// The project operator, if the plan has one.
    pub fn project_op(&self) -> Option<&OpId> {
        self.ops
            .values()
            .find(|op| matches!(op.kind, OpKind::Project { .. }))
            .map(|op| &op.id)
    }

    /// Allocates an operator id unused by this plan, continuing the
    /// planner's `o<n>` numbering.
    pub fn next_op_id(&self) -> OpId {
        let next = self
            .ops
            .keys()
            .filter_map(|id| id.as_str().strip_prefix('o'))
            .filter_map(|tail| tail.parse::<u64>().ok())
            .max()
            .map_or(0, |n| n + 1);
        OpId::new(format!("o{next}"))
    }

    /// Operator ids reachable from the root by following deps. A join's
    /// left and right both count as reachable.
    pub fn reachable(&self) -> BTreeSet<OpId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(op) = self.ops.get(&id) {
                stack.extend(op.deps.iter().cloned());
            }
        }
        seen
    }

    /// Structural validation. A failure here is the only fatal error class:
    /// the plan never starts executing.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_str().is_empty() || !self.ops.contains_key(&self.root) {
            return Err(PlasmaError::PlanInvalid(format!(
                "missing root operator '{}'",
                self.root
            )));
        }
        for op in self.ops.values() {
            for dep in &op.deps {
                if !self.ops.contains_key(dep) {
                    return Err(PlasmaError::PlanInvalid(format!(
                        "operator '{}' depends on unknown '{dep}'",
                        op.id
                    )));
                }
            }
            if let OpKind::Join = op.kind {
                if op.deps.len() != 2 {
                    return Err(PlasmaError::PlanInvalid(format!(
                        "join '{}' needs exactly two deps",
                        op.id
                    )));
                }
            }
        }
        for (name, id) in &self.params {
            match self.ops.get(id) {
                Some(op) if matches!(op.kind, OpKind::Parameter { .. }) => {}
                _ => {
                    return Err(PlasmaError::PlanInvalid(format!(
                        "param '{name}' points at non-parameter '{id}'"
                    )))
                }
            }
        }
        Ok(())
    }
}
