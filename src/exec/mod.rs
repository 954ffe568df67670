//! The streaming operator runtime.
//!
//! A query executes as one cooperative task per plan operator, wired
//! through bounded channels along the plan's dependency edges. Closure
//! propagates by sender drop: an operator's output closes exactly once,
//! after its upstreams (and, for receive, every accepted remote stream)
//! have closed. Nothing here mutates the graph.

mod context;
mod ops;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::PeerConfig;
use crate::error::{PlasmaError, Result};
use crate::graph::GraphStore;
use crate::model::PropValue;
use crate::net::Connector;
use crate::plan::{OpId, OpKind, Plan};
use crate::tuple::PathTuple;

pub use context::ErrorEvent;
pub(crate) use context::{OutputRegistry, RemoteStream, RuntimeContext};

/// A result record: projected field name to value.
pub type Row = BTreeMap<String, PropValue>;

/// Item of the public result stream. Errors ride the stream next to the
/// records; they never terminate it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum ResultEvent {
    /// One projected result record.
    Record(Row),
    /// A non-fatal error observed during execution.
    Error(ErrorEvent),
}

impl ResultEvent {
    /// The record, if this event is one.
    pub fn as_record(&self) -> Option<&Row> {
        match self {
            ResultEvent::Record(row) => Some(row),
            ResultEvent::Error(_) => None,
        }
    }

    /// The error, if this event is one.
    pub fn as_error(&self) -> Option<&ErrorEvent> {
        match self {
            ResultEvent::Error(err) => Some(err),
            ResultEvent::Record(_) => None,
        }
    }
}

/// Splits the records out of a collected event stream.
pub fn records(events: &[ResultEvent]) -> Vec<Row> {
    events
        .iter()
        .filter_map(|e| e.as_record().cloned())
        .collect()
}

/// Streaming handle over a query's result events.
#[derive(Debug)]
pub struct QueryStream {
    rx: mpsc::Receiver<ResultEvent>,
}

impl QueryStream {
    /// The next event, or `None` once the query has terminated.
    pub async fn next(&mut self) -> Option<ResultEvent> {
        self.rx.recv().await
    }

    /// Drains the stream to completion.
    pub async fn collect(mut self) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

/// Instantiates plans as operator task networks.
pub struct Runtime {
    graph: Arc<dyn GraphStore>,
    connector: Arc<Connector>,
    config: PeerConfig,
    outputs: OutputRegistry,
}

impl Runtime {
    /// Creates a runtime over a graph and a connection manager.
    pub fn new(graph: Arc<dyn GraphStore>, connector: Arc<Connector>, config: PeerConfig) -> Self {
        Self {
            graph,
            connector,
            config,
            outputs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a named outbound channel for send operators.
    pub fn register_channel(&self, name: impl Into<String>, tx: mpsc::Sender<PathTuple>) {
        self.outputs.lock().insert(name.into(), tx);
    }

    /// Removes a named outbound channel.
    pub fn unregister_channel(&self, name: &str) {
        self.outputs.lock().remove(name);
    }

    /// Validates the plan, wires the operator network, and starts it.
    /// Must run inside a tokio runtime. The returned stream terminates
    /// when every operator has shut down; dropping it early tears the
    /// network down through send failures.
    pub fn execute(
        &self,
        plan: Plan,
        params: BTreeMap<String, PropValue>,
    ) -> Result<QueryStream> {
        plan.validate()?;

        let mut values = plan.seeds.clone();
        values.extend(params);
        for name in plan.params.keys() {
            if !values.contains_key(name) {
                return Err(PlasmaError::PlanInvalid(format!(
                    "no seed value for parameter '{name}'"
                )));
            }
        }

        let plan = Arc::new(plan);
        let reachable = plan.reachable();
        let cap = self.config.channel_capacity;

        // Dependency edges become channel hookups. A join redirects: its
        // left feeds its right's input, and the join forwards the right's
        // output.
        let mut consumers: HashMap<OpId, Vec<OpId>> = HashMap::new();
        for id in &reachable {
            let op = plan.op(id).expect("reachable op present");
            if let OpKind::Join = op.kind {
                consumers
                    .entry(op.deps[0].clone())
                    .or_default()
                    .push(op.deps[1].clone());
                consumers
                    .entry(op.deps[1].clone())
                    .or_default()
                    .push(id.clone());
            } else {
                for dep in &op.deps {
                    consumers.entry(dep.clone()).or_default().push(id.clone());
                }
            }
        }

        let mut in_tx: HashMap<OpId, mpsc::Sender<PathTuple>> = HashMap::new();
        let mut in_rx: HashMap<OpId, mpsc::Receiver<PathTuple>> = HashMap::new();
        for id in &reachable {
            let (tx, rx) = mpsc::channel(cap);
            in_tx.insert(id.clone(), tx);
            in_rx.insert(id.clone(), rx);
        }

        let (mat_tx, mat_rx) = mpsc::channel::<PathTuple>(cap);
        let mut outs: HashMap<OpId, Vec<mpsc::Sender<PathTuple>>> = HashMap::new();
        for id in &reachable {
            let mut senders: Vec<mpsc::Sender<PathTuple>> = consumers
                .get(id)
                .map(|cs| cs.iter().map(|c| in_tx[c].clone()).collect())
                .unwrap_or_default();
            if *id == plan.root {
                senders.push(mat_tx.clone());
            }
            outs.insert(id.clone(), senders);
        }
        drop(in_tx);
        drop(mat_tx);

        // The remotes meta-channel: traverses hold the senders, the
        // receive op holds the receiver, so the meta side closes when the
        // last traverse finishes.
        let receive_id = plan.receive_op().cloned();
        let (remote_tx, remote_rx) = if receive_id.is_some() {
            let (tx, rx) = mpsc::unbounded_channel::<RemoteStream>();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let mut remote_rx = remote_rx;

        let (err_tx, err_rx) = mpsc::unbounded_channel::<ErrorEvent>();
        let ctx = RuntimeContext {
            graph: Arc::clone(&self.graph),
            connector: Arc::clone(&self.connector),
            plan: Arc::clone(&plan),
            values: Arc::new(values),
            errors: err_tx,
            outputs: Arc::clone(&self.outputs),
        };

        for id in &reachable {
            let op = plan.op(id).expect("reachable op present").clone();
            let input = in_rx.remove(id).expect("input channel created");
            let op_outs = outs.remove(id).unwrap_or_default();
            let meta = if Some(id) == receive_id.as_ref() {
                remote_rx.take()
            } else {
                None
            };
            let op_remote_tx = if matches!(op.kind, OpKind::Traverse { .. }) {
                remote_tx.clone()
            } else {
                None
            };
            tokio::spawn(ops::run(op, input, op_outs, ctx.clone(), meta, op_remote_tx));
        }
        drop(remote_tx);
        drop(ctx);

        let (res_tx, res_rx) = mpsc::channel(cap);
        tokio::spawn(materialize_loop(plan, mat_rx, err_rx, res_tx));
        Ok(QueryStream { rx: res_rx })
    }
}

async fn materialize_loop(
    plan: Arc<Plan>,
    mut root_rx: mpsc::Receiver<PathTuple>,
    mut err_rx: mpsc::UnboundedReceiver<ErrorEvent>,
    res_tx: mpsc::Sender<ResultEvent>,
) {
    let mut root_done = false;
    let mut err_done = false;
    while !(root_done && err_done) {
        tokio::select! {
            pt = root_rx.recv(), if !root_done => match pt {
                Some(pt) => {
                    let row = materialize(&plan, &pt);
                    if res_tx.send(ResultEvent::Record(row)).await.is_err() {
                        return;
                    }
                }
                None => root_done = true,
            },
            err = err_rx.recv(), if !err_done => match err {
                Some(event) => {
                    if res_tx.send(ResultEvent::Error(event)).await.is_err() {
                        return;
                    }
                }
                None => err_done = true,
            },
        }
    }
}

/// Converts a root-channel tuple into a result record: the projected
/// record when the plan projects, an aggregate value keyed by the
/// operator name, or the bound path variables as a fallback.
fn materialize(plan: &Plan, pt: &PathTuple) -> Row {
    if let Some(project) = plan.project_op() {
        if let Some(row) = pt.props(project) {
            return row.clone();
        }
    }
    if let Some(value) = pt.value(&plan.root) {
        let name = plan
            .op(&plan.root)
            .map(|op| op.kind.name())
            .unwrap_or("value");
        let mut row = Row::new();
        row.insert(name.to_owned(), value.clone());
        return row;
    }
    let mut row = Row::new();
    for (var, key) in &plan.pbind {
        if let Some(id) = pt.node(key) {
            row.insert(var.clone(), PropValue::from(id));
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PathQueryBuilder;
    use crate::expr::Expr;
    use crate::graph::{EdgePredicate, MemoryGraph};
    use crate::model::{NodeId, PropValue};
    use crate::plan::{OpNode, ROOT_PARAM};
    use crate::planner::{Planner, PlannerConfig};

    fn music_graph() -> Arc<MemoryGraph> {
        let g = MemoryGraph::new();
        let m = g.add(&[("label", PropValue::from("music"))]);
        let s = g.add(&[("label", PropValue::from("synths"))]);
        g.link(&NodeId::root(), &m, "music").unwrap();
        g.link(&m, &s, "synths").unwrap();
        for (name, score) in [("bass", 0.8), ("kick", 0.7), ("snare", 0.4), ("hat", 0.3)] {
            let n = g.add(&[("label", PropValue::from(name)), ("score", PropValue::Float(score))]);
            g.link(&s, &n, "synth").unwrap();
        }
        Arc::new(g)
    }

    fn runtime(graph: Arc<MemoryGraph>) -> Runtime {
        Runtime::new(graph, Arc::new(Connector::new()), PeerConfig::testing())
    }

    fn root_params() -> BTreeMap<String, PropValue> {
        let mut params = BTreeMap::new();
        params.insert(ROOT_PARAM.to_owned(), PropValue::from(crate::model::ROOT_ID));
        params
    }

    fn plan_of(query: &crate::planner::PathQuery) -> Plan {
        Planner::new(PlannerConfig::default()).plan(query).unwrap()
    }

    fn labels_of(rows: &[Row]) -> Vec<String> {
        let mut out: Vec<String> = rows
            .iter()
            .filter_map(|row| match row.get("synth") {
                Some(PropValue::Map(map)) => {
                    map.get("label").and_then(PropValue::as_str).map(str::to_owned)
                }
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn filtered_traversal_keeps_high_scores() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .filter(Expr::ge(Expr::prop("synth", "score"), Expr::lit(0.6)))
            .project("synth", &["label"])
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        assert!(events.iter().all(|e| e.as_error().is_none()));
        assert_eq!(labels_of(&records(&events)), vec!["bass", "kick"]);
    }

    #[tokio::test]
    async fn count_tail_counts_the_unfiltered_stream() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .count()
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        let rows = records(&events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("count"), Some(&PropValue::Int(4)));
    }

    #[tokio::test]
    async fn limit_emits_exactly_n_and_terminates() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .project("synth", &[])
            .limit(2)
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        assert_eq!(records(&events).len(), 2);
    }

    #[tokio::test]
    async fn sort_orders_by_loaded_property() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .project("synth", &["label", "score"])
            .sort("synth", "score")
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        assert_eq!(labels_of(&records(&events)), vec!["bass", "hat", "kick", "snare"]);
        // ascending by score: hat, snare, kick, bass
        let first = &records(&events)[0];
        assert_eq!(
            first.get("synth").and_then(|v| match v {
                PropValue::Map(m) => m.get("label").and_then(PropValue::as_str),
                _ => None,
            }),
            Some("hat")
        );
    }

    #[tokio::test]
    async fn min_and_max_pick_the_extremes() {
        for (build, expected) in [
            (
                PathQueryBuilder::new()
                    .segment("synth", &["music", "synths", "synth"])
                    .project("synth", &["label"])
                    .max("synth", "score")
                    .build(),
                "bass",
            ),
            (
                PathQueryBuilder::new()
                    .segment("synth", &["music", "synths", "synth"])
                    .project("synth", &["label"])
                    .min("synth", "score")
                    .build(),
                "hat",
            ),
        ] {
            let events = runtime(music_graph())
                .execute(plan_of(&build), root_params())
                .unwrap()
                .collect()
                .await;
            assert_eq!(labels_of(&records(&events)), vec![expected]);
        }
    }

    #[tokio::test]
    async fn average_emits_one_numeric_row() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .average("synth", "score")
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        let rows = records(&events);
        assert_eq!(rows.len(), 1);
        let mean = rows[0].get("average").and_then(PropValue::as_f64).unwrap();
        assert!((mean - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn choose_samples_without_exceeding_the_population() {
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .project("synth", &["label"])
            .choose(2)
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        let chosen = labels_of(&records(&events));
        assert_eq!(chosen.len(), 2);
        for label in &chosen {
            assert!(["bass", "kick", "snare", "hat"].contains(&label.as_str()));
        }
    }

    #[tokio::test]
    async fn type_mismatch_drops_the_tuple_and_reports() {
        // `label` is a string; comparing it numerically drops every tuple.
        let query = PathQueryBuilder::new()
            .segment("synth", &["music", "synths", "synth"])
            .filter(Expr::ge(Expr::prop("synth", "label"), Expr::lit(0.6)))
            .project("synth", &["label"])
            .build();
        let events = runtime(music_graph())
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        assert!(records(&events).is_empty());
        assert!(events
            .iter()
            .any(|e| e.as_error().is_some_and(|err| err.code == "type-mismatch")));
    }

    #[tokio::test]
    async fn cycles_do_not_wedge_a_traverse() {
        let g = MemoryGraph::new();
        let a = g.add(&[]);
        g.link(&NodeId::root(), &a, "loop").unwrap();
        g.link(&a, &NodeId::root(), "loop").unwrap();

        // Two hops over a two-cycle: the visited set stops re-expansion
        // and the query still terminates.
        let query = PathQueryBuilder::new()
            .segment("n", &["loop", "loop"])
            .project("n", &[])
            .build();
        let events = runtime(Arc::new(g))
            .execute(plan_of(&query), root_params())
            .unwrap()
            .collect()
            .await;
        let rows = records(&events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&PropValue::from(crate::model::ROOT_ID)));
    }

    #[tokio::test]
    async fn join_plumbs_left_output_through_the_right_op() {
        // Hand-built plan: param -> join(param, traverse). The traverse's
        // input comes from the join's left side.
        let graph = music_graph();
        let mut plan = Plan::new(4);
        let param = OpId::new("o0");
        let trav = OpId::new("o1");
        let join = OpId::new("o2");
        plan.ops.insert(
            param.clone(),
            OpNode {
                id: param.clone(),
                kind: OpKind::Parameter {
                    name: ROOT_PARAM.into(),
                },
                deps: vec![],
            },
        );
        plan.ops.insert(
            trav.clone(),
            OpNode {
                id: trav.clone(),
                kind: OpKind::Traverse {
                    src: param.clone(),
                    pred: EdgePredicate::Label("music".into()),
                },
                deps: vec![],
            },
        );
        plan.ops.insert(
            join.clone(),
            OpNode {
                id: join.clone(),
                kind: OpKind::Join,
                deps: vec![param.clone(), trav.clone()],
            },
        );
        plan.root = join.clone();
        plan.params.insert(ROOT_PARAM.into(), param.clone());
        plan.pbind.insert("m".into(), trav.clone());

        let events = runtime(graph)
            .execute(plan, root_params())
            .unwrap()
            .collect()
            .await;
        let rows = records(&events);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains_key("m"));
    }

    #[tokio::test]
    async fn missing_seed_is_fatal_before_execution() {
        let query = PathQueryBuilder::new()
            .segment("n", &["music"])
            .build();
        let err = runtime(music_graph())
            .execute(plan_of(&query), BTreeMap::new())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
