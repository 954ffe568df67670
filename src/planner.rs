//! Lowers a path query into an operator plan.

use std::collections::HashMap;

use crate::error::{PlasmaError, Result};
use crate::expr::Expr;
use crate::graph::EdgePredicate;
use crate::plan::{OpId, OpKind, OpNode, Plan, ProjectField, SortOrder, ROOT_PARAM};

/// One step of a path expression: a variable and the edge predicates
/// walked, in order, to reach it.
#[derive(Clone, Debug, PartialEq)]
pub struct PathSegment {
    /// Path-variable symbol bound to the segment's final node.
    pub var: String,
    /// Edge predicates traversed in sequence.
    pub preds: Vec<EdgePredicate>,
}

/// Terminal operation appended after filtering and projection.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryTail {
    /// Order results by a property of a path variable.
    Sort {
        /// Path variable whose property orders the stream.
        var: String,
        /// Property name.
        prop: String,
        /// Direction.
        order: SortOrder,
    },
    /// Keep the tuple with the smallest property value.
    Min {
        /// Path variable compared.
        var: String,
        /// Property name.
        prop: String,
    },
    /// Keep the tuple with the largest property value.
    Max {
        /// Path variable compared.
        var: String,
        /// Property name.
        prop: String,
    },
    /// Emit the numeric mean of a property.
    Average {
        /// Path variable averaged.
        var: String,
        /// Property name.
        prop: String,
    },
    /// Emit the number of results.
    Count,
    /// Emit a random sample of `n` results.
    Choose(usize),
    /// Pass the first `n` results, then shut the stream down.
    Limit(usize),
}

/// Declarative query input: path, optional filter, optional projection,
/// optional tail operations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathQuery {
    /// Path segments walked from the root.
    pub segments: Vec<PathSegment>,
    /// Filter expression over bound path variables.
    pub filter: Option<Expr>,
    /// Projection list: variable plus the properties to publish.
    pub projection: Option<Vec<(String, Vec<String>)>>,
    /// Tail operations, applied in order.
    pub tail: Vec<QueryTail>,
}

/// Planner knobs.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Hops-to-live stamped on produced plans.
    pub htl: u32,
    /// Inactivity timeout for remote channels merged at receive ops.
    pub remote_timeout_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            htl: 8,
            remote_timeout_ms: 5_000,
        }
    }
}

/// Lowers [`PathQuery`] values into [`Plan`]s.
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    /// Creates a planner with the given configuration.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Lowers a query. The produced plan keeps a linear primary spine:
    /// every appended operator depends on the previous root and becomes
    /// the new root.
    pub fn plan(&self, query: &PathQuery) -> Result<Plan> {
        if query.segments.is_empty() {
            return Err(PlasmaError::PlanInvalid(
                "query needs at least one path segment".into(),
            ));
        }
        let mut lowering = Lowering::new(self.config.htl);

        let param = lowering.push(
            OpKind::Parameter {
                name: ROOT_PARAM.to_owned(),
            },
            Vec::new(),
        );
        lowering.plan.params.insert(ROOT_PARAM.to_owned(), param);

        for segment in &query.segments {
            if segment.preds.is_empty() {
                return Err(PlasmaError::PlanInvalid(format!(
                    "segment '{}' has no edge predicates",
                    segment.var
                )));
            }
            for pred in &segment.preds {
                let src = lowering.root.clone();
                lowering.push(
                    OpKind::Traverse {
                        src,
                        pred: pred.clone(),
                    },
                    vec![lowering.root.clone()],
                );
            }
            lowering
                .plan
                .pbind
                .insert(segment.var.clone(), lowering.root.clone());
        }

        // Remote sub-query results splice in here, ahead of everything a
        // filter or projection will do to the stream.
        lowering.push(
            OpKind::Receive {
                timeout_ms: self.config.remote_timeout_ms,
            },
            vec![lowering.root.clone()],
        );

        if let Some(filter) = &query.filter {
            lowering.plan.filters.push(filter.clone());
            let lowered = lowering.lower_expr(filter)?;
            let key = match lowered {
                Expr::Slot(ref op) => op.clone(),
                other => lowering.push(OpKind::Expression { expr: other }, vec![lowering.root.clone()]),
            };
            lowering.push(
                OpKind::Select {
                    key: key.clone(),
                    pred: Expr::Slot(key),
                },
                vec![lowering.root.clone()],
            );
        }

        if let Some(projection) = &query.projection {
            lowering.plan.projection = Some(projection.clone());
            let mut fields = Vec::with_capacity(projection.len());
            for (var, props) in projection {
                let key = lowering.binding(var)?;
                let props_key = if props.is_empty() {
                    None
                } else {
                    Some(lowering.ensure_property(var, props)?)
                };
                fields.push(ProjectField {
                    var: var.clone(),
                    key,
                    props_key,
                    props: props.clone(),
                });
            }
            lowering.push(OpKind::Project { fields }, vec![lowering.root.clone()]);
        }

        for tail in &query.tail {
            match tail {
                QueryTail::Sort { var, prop, order } => {
                    let key = lowering.ensure_property(var, std::slice::from_ref(prop))?;
                    lowering.push(
                        OpKind::Sort {
                            key,
                            prop: prop.clone(),
                            order: *order,
                        },
                        vec![lowering.root.clone()],
                    );
                }
                QueryTail::Min { var, prop } => {
                    let key = lowering.ensure_property(var, std::slice::from_ref(prop))?;
                    lowering.push(
                        OpKind::Min {
                            key,
                            prop: prop.clone(),
                        },
                        vec![lowering.root.clone()],
                    );
                }
                QueryTail::Max { var, prop } => {
                    let key = lowering.ensure_property(var, std::slice::from_ref(prop))?;
                    lowering.push(
                        OpKind::Max {
                            key,
                            prop: prop.clone(),
                        },
                        vec![lowering.root.clone()],
                    );
                }
                QueryTail::Average { var, prop } => {
                    let key = lowering.ensure_property(var, std::slice::from_ref(prop))?;
                    lowering.push(
                        OpKind::Average {
                            key,
                            prop: prop.clone(),
                        },
                        vec![lowering.root.clone()],
                    );
                }
                QueryTail::Count => {
                    lowering.push(OpKind::Count, vec![lowering.root.clone()]);
                }
                QueryTail::Choose(n) => {
                    lowering.push(OpKind::Choose { n: *n }, vec![lowering.root.clone()]);
                }
                QueryTail::Limit(n) => {
                    lowering.push(OpKind::Limit { n: *n }, vec![lowering.root.clone()]);
                }
            }
        }

        let mut plan = lowering.finish();
        plan.validate()?;
        Ok(plan)
    }
}

struct Lowering {
    plan: Plan,
    root: OpId,
    counter: u64,
    prop_ops: HashMap<String, OpId>,
}

impl Lowering {
    fn new(htl: u32) -> Self {
        Self {
            plan: Plan::new(htl),
            root: OpId::new(""),
            counter: 0,
            prop_ops: HashMap::new(),
        }
    }

    fn push(&mut self, kind: OpKind, deps: Vec<OpId>) -> OpId {
        let id = OpId::new(format!("o{}", self.counter));
        self.counter += 1;
        self.plan.ops.insert(
            id.clone(),
            OpNode {
                id: id.clone(),
                kind,
                deps,
            },
        );
        self.root = id.clone();
        id
    }

    fn binding(&self, var: &str) -> Result<OpId> {
        self.plan
            .pbind
            .get(var)
            .cloned()
            .ok_or_else(|| PlasmaError::PlanInvalid(format!("unknown path variable '{var}'")))
    }

    /// Appends (or extends) the property operator that pre-loads the given
    /// properties of a path variable, returning its id.
    fn ensure_property(&mut self, var: &str, props: &[String]) -> Result<OpId> {
        let key = self.binding(var)?;
        if let Some(existing) = self.prop_ops.get(var).cloned() {
            if let Some(node) = self.plan.ops.get_mut(&existing) {
                if let OpKind::Property { props: have, .. } = &mut node.kind {
                    for prop in props {
                        if !have.contains(prop) {
                            have.push(prop.clone());
                        }
                    }
                }
            }
            return Ok(existing);
        }
        let id = self.push(
            OpKind::Property {
                key,
                props: props.to_vec(),
            },
            vec![self.root.clone()],
        );
        self.prop_ops.insert(var.to_owned(), id.clone());
        Ok(id)
    }

    /// Depth-first lowering of a filter expression: pvar properties become
    /// property operators, calls become expression operators, and the
    /// returned expression references only slots and literals.
    fn lower_expr(&mut self, expr: &Expr) -> Result<Expr> {
        match expr {
            Expr::Literal(v) => Ok(Expr::Literal(v.clone())),
            Expr::Loaded { .. } | Expr::Slot(_) => Ok(expr.clone()),
            Expr::Prop { pvar, prop } => {
                let op = self.ensure_property(pvar, std::slice::from_ref(prop))?;
                Ok(Expr::Loaded {
                    op,
                    prop: prop.clone(),
                })
            }
            Expr::Call { op, args } => {
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    lowered.push(self.lower_expr(arg)?);
                }
                let id = self.push(
                    OpKind::Expression {
                        expr: Expr::Call {
                            op: *op,
                            args: lowered,
                        },
                    },
                    vec![self.root.clone()],
                );
                Ok(Expr::Slot(id))
            }
        }
    }

    fn finish(mut self) -> Plan {
        self.plan.root = self.root;
        self.plan
    }
}
