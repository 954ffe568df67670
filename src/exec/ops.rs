//! The operator task bodies. One task per plan operator, communicating
//! only over its channels; every task closes its output by dropping its
//! senders once its upstreams are drained.

use std::collections::HashSet;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::error::PlasmaError;
use crate::expr::{self, Expr};
use crate::graph::EdgePredicate;
use crate::model::{NodeId, PropValue};
use crate::net::{PeerUrl, StreamFrame};
use crate::plan::{OpId, OpKind, OpNode, ProjectField, SortOrder};
use crate::subplan;
use crate::tuple::{PathTuple, Slot};

use super::context::{RemoteStream, RuntimeContext};

/// Sends a tuple to every downstream input. Returns false once every
/// downstream has gone away, which is the shutdown signal for the sender.
async fn emit(outs: &[mpsc::Sender<PathTuple>], pt: PathTuple) -> bool {
    let mut delivered = false;
    for out in outs {
        if out.send(pt.clone()).await.is_ok() {
            delivered = true;
        }
    }
    delivered
}

/// Entry point for one operator task.
pub(crate) async fn run(
    node: OpNode,
    input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: RuntimeContext,
    meta: Option<mpsc::UnboundedReceiver<RemoteStream>>,
    remote_tx: Option<mpsc::UnboundedSender<RemoteStream>>,
) {
    match node.kind.clone() {
        OpKind::Parameter { name } => run_parameter(&node, &name, outs, &ctx).await,
        OpKind::Traverse { src, pred } => {
            run_traverse(&node, &src, &pred, input, outs, &ctx, remote_tx).await
        }
        OpKind::Join => run_forward(input, outs).await,
        OpKind::Property { key, props } => {
            run_property(&node, &key, &props, input, outs, &ctx).await
        }
        OpKind::Select { pred, .. } => run_select(&pred, input, outs, &ctx).await,
        OpKind::Expression { expr } => run_expression(&node, &expr, input, outs, &ctx).await,
        OpKind::Project { fields } => run_project(&node, &fields, input, outs, &ctx).await,
        OpKind::Limit { n } => run_limit(n, input, outs).await,
        OpKind::Send { dest } => run_send(&dest, input, outs, &ctx).await,
        OpKind::Receive { timeout_ms } => {
            // Only the first receive of a plan owns the remotes channel; any
            // other degrades to a plain forward over an already-closed one.
            let meta = meta.unwrap_or_else(|| {
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            });
            run_receive(timeout_ms, input, outs, meta, &ctx).await
        }
        kind => run_aggregate(&node, kind, input, outs, &ctx).await,
    }
}

async fn run_parameter(
    node: &OpNode,
    name: &str,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    let seeds = match ctx.values.get(name) {
        Some(PropValue::Str(id)) => vec![NodeId::new(id.clone())],
        Some(PropValue::List(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(NodeId::new))
            .collect(),
        Some(other) => {
            ctx.report(&PlasmaError::TypeMismatch(format!(
                "parameter '{name}' seeded with non-id {other:?}"
            )));
            Vec::new()
        }
        None => Vec::new(), // rejected before execution starts
    };
    for id in seeds {
        let pt = PathTuple::empty().bind(&node.id, Slot::Node(id));
        if !emit(&outs, pt).await {
            break;
        }
    }
}

async fn run_traverse(
    node: &OpNode,
    src_key: &OpId,
    pred: &EdgePredicate,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
    remote_tx: Option<mpsc::UnboundedSender<RemoteStream>>,
) {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut emitted: HashSet<NodeId> = HashSet::new();
    while let Some(pt) = input.recv().await {
        let Some(src) = pt.node(src_key).cloned() else {
            ctx.report(&PlasmaError::TypeMismatch(format!(
                "traverse {} found no node bound at {src_key}",
                node.id
            )));
            continue;
        };
        if !visited.insert(src.clone()) {
            continue;
        }
        if ctx.graph.is_proxy(&src) {
            cross_proxy(node, &src, &pt, ctx, remote_tx.as_ref()).await;
            continue;
        }
        match ctx.graph.edges(&src, pred) {
            Ok(edges) => {
                for target in edges.into_keys() {
                    if !emitted.insert(target.clone()) {
                        continue;
                    }
                    let next = pt.bind(&node.id, Slot::Node(target));
                    if !emit(&outs, next).await {
                        return;
                    }
                }
            }
            Err(err) => ctx.report(&err),
        }
    }
}

/// A traverse hit a proxy node: cut a sub-plan at this operator, open a
/// sub-query stream to the proxy's peer, and hand the stream to the
/// receive operator. A failure here closes this branch only.
async fn cross_proxy(
    node: &OpNode,
    src: &NodeId,
    pt: &PathTuple,
    ctx: &RuntimeContext,
    remote_tx: Option<&mpsc::UnboundedSender<RemoteStream>>,
) {
    let Some(proxy) = ctx.graph.find_node(src) else {
        ctx.report(&PlasmaError::GraphMissing(src.to_string()));
        return;
    };
    let Some(url_str) = proxy.proxy() else {
        return;
    };
    let Some(remote_tx) = remote_tx else {
        tracing::warn!(op = %node.id, "proxy crossing without a receive operator; dropping");
        return;
    };
    if ctx.plan.htl == 0 {
        ctx.report(&PlasmaError::HtlExhausted);
        return;
    }
    let url: PeerUrl = match url_str.parse() {
        Ok(url) => url,
        Err(err) => {
            ctx.report(&err);
            return;
        }
    };
    let sub = match subplan::extract(&ctx.plan, &node.id, &proxy.proxy_target()) {
        Ok(mut sub) => {
            sub.htl = ctx.plan.htl - 1;
            sub
        }
        Err(err) => {
            ctx.report(&err);
            return;
        }
    };
    tracing::debug!(op = %node.id, proxy = src.short(), peer = %url, "proxy crossing");
    match ctx.connector.open_stream(&url, &sub).await {
        Ok(frames) => {
            let _ = remote_tx.send(RemoteStream {
                frames,
                base: pt.clone(),
            });
        }
        Err(err) => ctx.report(&err),
    }
}

async fn run_forward(mut input: mpsc::Receiver<PathTuple>, outs: Vec<mpsc::Sender<PathTuple>>) {
    while let Some(pt) = input.recv().await {
        if !emit(&outs, pt).await {
            return;
        }
    }
}

async fn run_property(
    node: &OpNode,
    key: &OpId,
    props: &[String],
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    while let Some(pt) = input.recv().await {
        let have = pt.props(&node.id);
        let satisfied = have.is_some_and(|map| props.iter().all(|p| map.contains_key(p)));
        if satisfied {
            if !emit(&outs, pt).await {
                return;
            }
            continue;
        }
        let Some(src) = pt.node(key).cloned() else {
            // A tuple cut loose from a sub-plan may lack pre-cut bindings;
            // the peer holding them resolves this operator instead.
            tracing::debug!(op = %node.id, key = %key, "property source unbound; forwarding");
            if !emit(&outs, pt).await {
                return;
            }
            continue;
        };
        let next = match ctx.graph.find_node(&src) {
            Some(found) => {
                let mut map = have.cloned().unwrap_or_default();
                for prop in props {
                    if let Some(value) = found.get(prop) {
                        map.insert(prop.clone(), value.clone());
                    }
                }
                pt.bind(&node.id, Slot::Props(map))
            }
            None => {
                // Not local; a peer holding the node loads these instead.
                tracing::debug!(node = src.short(), op = %node.id, "property load skipped");
                pt
            }
        };
        if !emit(&outs, next).await {
            return;
        }
    }
}

async fn run_select(
    pred: &Expr,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    while let Some(pt) = input.recv().await {
        match expr::eval(pred, &pt).and_then(|v| expr::truthy(&v)) {
            Ok(true) => {
                if !emit(&outs, pt).await {
                    return;
                }
            }
            Ok(false) => {}
            Err(err) => ctx.report(&err),
        }
    }
}

async fn run_expression(
    node: &OpNode,
    expr: &Expr,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    while let Some(pt) = input.recv().await {
        match expr::eval(expr, &pt) {
            Ok(value) => {
                let next = pt.bind(&node.id, Slot::Value(value));
                if !emit(&outs, next).await {
                    return;
                }
            }
            Err(err) => ctx.report(&err),
        }
    }
}

async fn run_project(
    node: &OpNode,
    fields: &[ProjectField],
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    _ctx: &RuntimeContext,
) {
    while let Some(pt) = input.recv().await {
        let mut row = std::collections::BTreeMap::new();
        for field in fields {
            if field.props.is_empty() {
                match pt.node(&field.key) {
                    Some(id) => {
                        row.insert(field.var.clone(), PropValue::from(id));
                    }
                    None => {
                        // Unbound on this peer; the originator re-projects
                        // merged tuples with the full path context.
                        tracing::debug!(var = %field.var, op = %node.id, "projection field unbound");
                    }
                }
            } else {
                let loaded = field
                    .props_key
                    .as_ref()
                    .and_then(|k| pt.props(k))
                    .cloned()
                    .unwrap_or_default();
                let subset: std::collections::BTreeMap<_, _> = field
                    .props
                    .iter()
                    .filter_map(|p| loaded.get(p).map(|v| (p.clone(), v.clone())))
                    .collect();
                row.insert(field.var.clone(), PropValue::Map(subset));
            }
        }
        let next = pt.bind(&node.id, Slot::Props(row));
        if !emit(&outs, next).await {
            return;
        }
    }
}

/// Shared body of the buffering operators: aggregate, sort, min, max,
/// average, count, choose. They hold everything until the input closes,
/// then emit their fold.
async fn run_aggregate(
    node: &OpNode,
    kind: OpKind,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    let mut buffer: Vec<PathTuple> = Vec::new();
    while let Some(pt) = input.recv().await {
        buffer.push(pt);
    }
    let folded: Vec<PathTuple> = match kind {
        OpKind::Aggregate => buffer,
        OpKind::Sort { key, prop, order } => {
            let mut buffer = buffer;
            buffer.sort_by(|a, b| {
                let cmp = match (keyed(a, &key, &prop), keyed(b, &key, &prop)) {
                    (Some(x), Some(y)) => {
                        x.partial_cmp_value(y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match order {
                    SortOrder::Asc => cmp,
                    SortOrder::Desc => cmp.reverse(),
                }
            });
            buffer
        }
        OpKind::Min { key, prop } => extreme(buffer, &key, &prop, std::cmp::Ordering::Less),
        OpKind::Max { key, prop } => extreme(buffer, &key, &prop, std::cmp::Ordering::Greater),
        OpKind::Average { key, prop } => {
            let values: Vec<f64> = buffer
                .iter()
                .filter_map(|pt| keyed(pt, &key, &prop).and_then(PropValue::as_f64))
                .collect();
            if values.is_empty() {
                ctx.report(&PlasmaError::TypeMismatch(format!(
                    "average over '{prop}' saw no numeric values"
                )));
                Vec::new()
            } else {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                vec![PathTuple::empty().bind(&node.id, Slot::Value(PropValue::Float(mean)))]
            }
        }
        OpKind::Count => {
            vec![PathTuple::empty().bind(
                &node.id,
                Slot::Value(PropValue::Int(buffer.len() as i64)),
            )]
        }
        OpKind::Choose { n } => {
            if buffer.len() <= n {
                buffer
            } else {
                let mut rng = rand::thread_rng();
                buffer.choose_multiple(&mut rng, n).cloned().collect()
            }
        }
        other => {
            tracing::warn!(op = %node.id, kind = other.name(), "unexpected aggregate kind");
            buffer
        }
    };
    for pt in folded {
        if !emit(&outs, pt).await {
            return;
        }
    }
}

fn keyed<'a>(pt: &'a PathTuple, key: &OpId, prop: &str) -> Option<&'a PropValue> {
    pt.props(key).and_then(|map| map.get(prop))
}

fn extreme(buffer: Vec<PathTuple>, key: &OpId, prop: &str, wanted: std::cmp::Ordering) -> Vec<PathTuple> {
    let mut best: Option<PathTuple> = None;
    for pt in buffer {
        let Some(value) = keyed(&pt, key, prop) else {
            continue;
        };
        let better = match best.as_ref().and_then(|b| keyed(b, key, prop)) {
            Some(current) => value.partial_cmp_value(current) == Some(wanted),
            None => true,
        };
        if better {
            best = Some(pt);
        }
    }
    best.into_iter().collect()
}

async fn run_limit(n: usize, mut input: mpsc::Receiver<PathTuple>, outs: Vec<mpsc::Sender<PathTuple>>) {
    let mut outs = if n == 0 { None } else { Some(outs) };
    let mut sent = 0usize;
    while let Some(pt) = input.recv().await {
        if let Some(active) = &outs {
            if !emit(active, pt).await {
                return;
            }
            sent += 1;
            if sent == n {
                // Close downstream now; keep draining upstream silently.
                outs = None;
            }
        }
    }
}

async fn run_send(
    dest: &str,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    ctx: &RuntimeContext,
) {
    let dest_tx = ctx.take_output(dest);
    if dest_tx.is_none() {
        tracing::warn!(dest, "send operator has no registered channel");
    }
    while let Some(pt) = input.recv().await {
        if let Some(tx) = &dest_tx {
            if tx.send(pt.clone()).await.is_err() {
                tracing::debug!(dest, "send destination closed early");
            }
        }
        let _ = emit(&outs, pt).await;
    }
    // dest_tx drops here, closing the destination with the input
}

async fn run_receive(
    timeout_ms: u64,
    mut input: mpsc::Receiver<PathTuple>,
    outs: Vec<mpsc::Sender<PathTuple>>,
    mut meta: mpsc::UnboundedReceiver<RemoteStream>,
    ctx: &RuntimeContext,
) {
    let timeout = Duration::from_millis(timeout_ms);
    let mut input_done = false;
    let mut meta_done = false;
    while !(input_done && meta_done) {
        tokio::select! {
            pt = input.recv(), if !input_done => match pt {
                Some(pt) => {
                    if !emit(&outs, pt).await {
                        return;
                    }
                }
                None => input_done = true,
            },
            remote = meta.recv(), if !meta_done => match remote {
                Some(remote) => {
                    // Remote streams drain concurrently; the output closes
                    // only when this task and every pump have dropped
                    // their senders.
                    tokio::spawn(pump_remote(remote, outs.clone(), timeout, ctx.clone()));
                }
                None => meta_done = true,
            },
        }
    }
}

async fn pump_remote(
    mut remote: RemoteStream,
    outs: Vec<mpsc::Sender<PathTuple>>,
    timeout: Duration,
    ctx: RuntimeContext,
) {
    loop {
        match tokio::time::timeout(timeout, remote.frames.recv()).await {
            Err(_) => {
                tracing::debug!("remote channel idle past timeout; closed as drained");
                return;
            }
            Ok(None) => return,
            Ok(Some(StreamFrame::Tuple(pt))) => {
                let merged = remote.base.merge(&pt);
                if !emit(&outs, merged).await {
                    return;
                }
            }
            Ok(Some(StreamFrame::Error { code, message })) => {
                ctx.report_event(super::context::ErrorEvent { code, message });
            }
            Ok(Some(StreamFrame::End)) => return,
        }
    }
}
