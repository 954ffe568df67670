//! The peer facade: the RPC surface of one graph-owning process, plus the
//! recursive and iterated query drivers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::PeerConfig;
use crate::error::{PlasmaError, Result};
use crate::exec::{ErrorEvent, QueryStream, ResultEvent, Row, Runtime};
use crate::expr;
use crate::graph::GraphStore;
use crate::model::{Node, NodeId, PropValue, ID_PREFIX, ID_PROP};
use crate::net::{read_frame, write_frame, Connector, PeerUrl, Request, Response, StreamFrame};
use crate::plan::{OpKind, OpNode, Plan, PlanKind, ROOT_PARAM};
use crate::planner::{PathQuery, Planner, PlannerConfig};

/// Fixed marker returned by `ping`.
pub const PONG: &str = "pong";

/// A peer: one graph, one listener, one runtime. Share it behind an
/// [`Arc`]; the listener and every driver borrow it that way.
pub struct Peer {
    graph: Arc<dyn GraphStore>,
    connector: Arc<Connector>,
    runtime: Runtime,
    config: PeerConfig,
    url: Mutex<Option<PeerUrl>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    recur_waiters: Mutex<HashMap<String, oneshot::Sender<Vec<ResultEvent>>>>,
}

impl Peer {
    /// A peer with its own connection manager.
    pub fn new(graph: Arc<dyn GraphStore>, config: PeerConfig) -> Self {
        Self::with_connector(graph, Arc::new(Connector::new()), config)
    }

    /// A peer sharing an existing connection manager.
    pub fn with_connector(
        graph: Arc<dyn GraphStore>,
        connector: Arc<Connector>,
        config: PeerConfig,
    ) -> Self {
        let runtime = Runtime::new(Arc::clone(&graph), Arc::clone(&connector), config.clone());
        Self {
            graph,
            connector,
            runtime,
            config,
            url: Mutex::new(None),
            listener: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            recur_waiters: Mutex::new(HashMap::new()),
        }
    }

    /// The connection manager this peer sends through.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// The URL this peer listens on, once serving.
    pub fn url(&self) -> Option<PeerUrl> {
        self.url.lock().clone()
    }

    /// Lowers a path query with this peer's planner defaults.
    pub fn plan(&self, query: &PathQuery) -> Result<Plan> {
        Planner::new(PlannerConfig {
            htl: self.config.default_htl,
            remote_timeout_ms: self.config.remote_timeout_ms,
        })
        .plan(query)
    }

    /// Binds the listener and starts accepting connections.
    pub async fn serve(self: &Arc<Self>) -> Result<PeerUrl> {
        crate::telemetry::install_tracing_subscriber();
        let listener =
            TcpListener::bind((self.config.bind_host.as_str(), self.config.bind_port)).await?;
        let url = PeerUrl::new(self.config.bind_host.clone(), listener.local_addr()?.port());
        *self.url.lock() = Some(url.clone());

        let peer = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            tracing::debug!(%remote, "connection accepted");
                            tokio::spawn(handle_conn(Arc::clone(&peer), stream));
                        }
                        Err(err) => tracing::warn!(%err, "accept failed"),
                    },
                }
            }
        });
        *self.listener.lock() = Some(handle);
        tracing::info!(%url, "peer listening");
        Ok(url)
    }

    /// Stops the listener. In-flight queries drain on their own.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.url.lock() = None;
        tracing::info!("peer closed");
    }

    /// Liveness marker.
    pub fn ping(&self) -> &'static str {
        PONG
    }

    /// Fetches a node by its identifier.
    pub fn node_by_uuid(&self, id: &NodeId) -> Option<Node> {
        self.graph.find_node(id)
    }

    /// Runs a plan to completion, honoring the configured wall-clock
    /// budget. On expiry the root channel closes and the operator network
    /// observes shutdown; the caller gets a timeout event.
    pub async fn query(
        &self,
        plan: Plan,
        params: BTreeMap<String, PropValue>,
    ) -> Result<Vec<ResultEvent>> {
        match plan.kind {
            PlanKind::Query => {
                let stream = self.runtime.execute(plan, params)?;
                let budget = Duration::from_millis(self.config.query_timeout_ms);
                match tokio::time::timeout(budget, stream.collect()).await {
                    Ok(events) => Ok(events),
                    Err(_) => {
                        tracing::warn!("query exceeded wall-clock budget");
                        Ok(vec![ResultEvent::Error(ErrorEvent::from(
                            &PlasmaError::Timeout("query wall-clock budget".into()),
                        ))])
                    }
                }
            }
            PlanKind::IterNQuery => {
                let mut plan = plan;
                plan.seeds.extend(params);
                self.iter_n_query(plan).await
            }
            PlanKind::RecurQuery => {
                let mut plan = plan;
                plan.seeds.extend(params);
                self.recur_query(plan).await
            }
        }
    }

    /// Runs a single-round plan and hands back the live result stream.
    pub fn query_channel(
        &self,
        plan: Plan,
        params: BTreeMap<String, PropValue>,
    ) -> Result<QueryStream> {
        self.runtime.execute(plan, params)
    }

    /// Executes a shipped sub-plan, streaming its root output onto `out`
    /// frame by frame. Never buffers; closes `out` with an end marker
    /// when the plan terminates.
    pub async fn sub_query(&self, mut plan: Plan, out: mpsc::Sender<StreamFrame>) -> Result<()> {
        // The sender already spent a hop shipping this plan; a further
        // crossing is what the traverse-side htl guard refuses.
        let dest = format!("sub:{}:{}", plan.qid, uuid::Uuid::new_v4());
        let (tuple_tx, mut tuple_rx) = mpsc::channel(self.config.channel_capacity);
        self.runtime.register_channel(&dest, tuple_tx);

        let send_id = plan.next_op_id();
        plan.ops.insert(
            send_id.clone(),
            OpNode {
                id: send_id.clone(),
                kind: OpKind::Send { dest: dest.clone() },
                deps: vec![plan.root.clone()],
            },
        );
        plan.root = send_id;

        let mut stream = match self.runtime.execute(plan, BTreeMap::new()) {
            Ok(stream) => stream,
            Err(err) => {
                self.runtime.unregister_channel(&dest);
                return Err(err);
            }
        };

        let mut tuples_done = false;
        let mut events_done = false;
        while !(tuples_done && events_done) {
            tokio::select! {
                pt = tuple_rx.recv(), if !tuples_done => match pt {
                    Some(pt) => {
                        if out.send(StreamFrame::Tuple(pt)).await.is_err() {
                            break;
                        }
                    }
                    None => tuples_done = true,
                },
                event = stream.next(), if !events_done => match event {
                    Some(ResultEvent::Error(err)) => {
                        let _ = out
                            .send(StreamFrame::Error {
                                code: err.code,
                                message: err.message,
                            })
                            .await;
                    }
                    Some(ResultEvent::Record(_)) => {}
                    None => events_done = true,
                },
            }
        }
        self.runtime.unregister_channel(&dest);
        let _ = out.send(StreamFrame::End).await;
        Ok(())
    }

    /// Drives an iter-n plan: each round runs the plan, then reseeds the
    /// root binding with the round's results, until the round budget or
    /// the hop budget runs out.
    pub async fn iter_n_query(&self, plan: Plan) -> Result<Vec<ResultEvent>> {
        let mut plan = plan;
        loop {
            if plan.iter_n == 0 {
                return Ok(Vec::new());
            }
            plan.iter_n -= 1;
            plan.htl = plan.htl.saturating_sub(1);

            let mut round = plan.clone();
            round.kind = PlanKind::Query;
            let events = self
                .runtime
                .execute(round, BTreeMap::new())?
                .collect()
                .await;

            if plan.iter_n == 0 {
                return Ok(events);
            }
            if plan.htl == 0 {
                return Ok(vec![ResultEvent::Error(ErrorEvent::from(
                    &PlasmaError::HtlExhausted,
                ))]);
            }
            let ids = record_ids(&events);
            if ids.is_empty() {
                return Ok(events);
            }
            tracing::debug!(
                round_results = ids.len(),
                remaining = plan.iter_n,
                htl = plan.htl,
                "iter-n rebinding root"
            );
            plan.seeds.insert(ROOT_PARAM.to_owned(), PropValue::List(ids));
        }
    }

    /// Drives a recur plan: the per-tuple predicate decides which results
    /// reseed another local round and which are final. When the plan
    /// names a remote originator, the finals travel back to it as a
    /// single result event.
    pub async fn recur_query(&self, plan: Plan) -> Result<Vec<ResultEvent>> {
        let mut plan = plan;
        let mut finals: Vec<ResultEvent> = Vec::new();
        loop {
            if plan.htl == 0 {
                finals.push(ResultEvent::Error(ErrorEvent::from(
                    &PlasmaError::HtlExhausted,
                )));
                break;
            }
            plan.htl -= 1;

            let mut round = plan.clone();
            round.kind = PlanKind::Query;
            let events = self
                .runtime
                .execute(round, BTreeMap::new())?
                .collect()
                .await;

            let mut next_ids = Vec::new();
            for event in events {
                let verdict = match (&plan.pred, event.as_record()) {
                    (Some(pred), Some(row)) => {
                        Some(expr::eval_on_record(pred, row).and_then(|v| expr::truthy(&v)))
                    }
                    _ => None,
                };
                match verdict {
                    Some(Ok(true)) => {
                        if let Some(row) = event.as_record() {
                            next_ids.extend(row_ids(row));
                        }
                    }
                    Some(Err(err)) => finals.push(ResultEvent::Error(ErrorEvent::from(&err))),
                    Some(Ok(false)) | None => finals.push(event),
                }
            }
            if next_ids.is_empty() {
                break;
            }
            dedupe(&mut next_ids);
            plan.seeds
                .insert(ROOT_PARAM.to_owned(), PropValue::List(next_ids));
        }

        if let Some(src) = plan.src_url.as_deref() {
            if let Ok(origin) = src.parse::<PeerUrl>() {
                if self.url().as_ref() != Some(&origin) {
                    let payload = json!([plan.qid, finals]);
                    if let Err(err) = self
                        .connector
                        .request(&origin, "recur-result", payload)
                        .await
                    {
                        tracing::warn!(%origin, %err, "failed to deliver recur result");
                    }
                }
            }
        }
        Ok(finals)
    }

    /// Originator side of `recur-query`: ships the plan to a remote peer
    /// and waits for the single result event it posts back. Requires this
    /// peer to be serving.
    pub async fn recur_query_remote(
        self: &Arc<Self>,
        peer: &PeerUrl,
        mut plan: Plan,
    ) -> Result<Vec<ResultEvent>> {
        let own = self.url().ok_or_else(|| {
            PlasmaError::Transport("peer must be serving to receive recur results".into())
        })?;
        plan.kind = PlanKind::RecurQuery;
        plan.src_url = Some(own.to_string());

        let (tx, rx) = oneshot::channel();
        self.recur_waiters.lock().insert(plan.qid.clone(), tx);
        let qid = plan.qid.clone();

        if let Err(err) = self.connector.request(peer, "recur-query", json!([plan])).await {
            self.recur_waiters.lock().remove(&qid);
            return Err(err);
        }
        let budget = Duration::from_millis(self.config.query_timeout_ms);
        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(_)) => Err(PlasmaError::Transport("recur result channel dropped".into())),
            Err(_) => {
                self.recur_waiters.lock().remove(&qid);
                Err(PlasmaError::Timeout("waiting for recur result".into()))
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, req: Request) -> Response {
        let id = req.id;
        match self.dispatch_inner(req).await {
            Ok(result) => Response::ok(id, result),
            Err(err) => {
                tracing::debug!(code = err.code(), %err, "request failed");
                Response::fail(id, err.to_string())
            }
        }
    }

    async fn dispatch_inner(self: &Arc<Self>, req: Request) -> Result<serde_json::Value> {
        match req.method.as_str() {
            "ping" => Ok(json!(PONG)),
            "node-by-uuid" => {
                let id: String = param_at(&req.params, 0)?;
                match self.node_by_uuid(&NodeId::new(id)) {
                    Some(node) => Ok(serde_json::to_value(node)?),
                    None => Ok(serde_json::Value::Null),
                }
            }
            "query" => {
                let plan: Plan = param_at(&req.params, 0)?;
                let params: BTreeMap<String, PropValue> = match req.params.get(1) {
                    Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
                    _ => BTreeMap::new(),
                };
                let events = self.query(plan, params).await?;
                Ok(serde_json::to_value(events)?)
            }
            "iter-n-query" => {
                let plan: Plan = param_at(&req.params, 0)?;
                let events = self.iter_n_query(plan).await?;
                Ok(serde_json::to_value(events)?)
            }
            "recur-query" => {
                let plan: Plan = param_at(&req.params, 0)?;
                plan.validate()?;
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = peer.recur_query(plan).await {
                        tracing::warn!(%err, "recur query driver failed");
                    }
                });
                Ok(json!("accepted"))
            }
            "recur-result" => {
                let qid: String = param_at(&req.params, 0)?;
                let events: Vec<ResultEvent> = param_at(&req.params, 1)?;
                match self.recur_waiters.lock().remove(&qid) {
                    Some(waiter) => {
                        let _ = waiter.send(events);
                        Ok(json!(true))
                    }
                    None => Err(PlasmaError::Remote(format!(
                        "no recur query waiting under '{qid}'"
                    ))),
                }
            }
            other => Err(PlasmaError::Remote(format!("unknown method '{other}'"))),
        }
    }
}

async fn handle_conn(peer: Arc<Peer>, mut stream: TcpStream) {
    loop {
        let req = match read_frame::<_, Request>(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "dropping connection on bad frame");
                return;
            }
        };
        if req.method == "sub-query" {
            // The connection switches to the stream channel and is
            // consumed by it.
            handle_sub_query(peer, req, stream).await;
            return;
        }
        let response = peer.dispatch(req).await;
        if write_frame(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

async fn handle_sub_query(peer: Arc<Peer>, req: Request, mut stream: TcpStream) {
    let plan: Plan = match param_at(&req.params, 0) {
        Ok(plan) => plan,
        Err(err) => {
            let _ = write_frame(
                &mut stream,
                &StreamFrame::Error {
                    code: err.code().to_owned(),
                    message: err.to_string(),
                },
            )
            .await;
            let _ = write_frame(&mut stream, &StreamFrame::End).await;
            return;
        }
    };
    tracing::debug!(qid = %plan.qid, htl = plan.htl, "executing sub-query");

    let (tx, mut rx) = mpsc::channel::<StreamFrame>(64);
    let driver = {
        let peer = Arc::clone(&peer);
        tokio::spawn(async move { peer.sub_query(plan, tx).await })
    };
    while let Some(frame) = rx.recv().await {
        if write_frame(&mut stream, &frame).await.is_err() {
            return;
        }
    }
    if let Ok(Err(err)) = driver.await {
        let _ = write_frame(
            &mut stream,
            &StreamFrame::Error {
                code: err.code().to_owned(),
                message: err.to_string(),
            },
        )
        .await;
        let _ = write_frame(&mut stream, &StreamFrame::End).await;
    }
}

fn param_at<T: DeserializeOwned>(params: &serde_json::Value, idx: usize) -> Result<T> {
    let value = params
        .get(idx)
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(value)?)
}

/// Node ids found among a round's projected records, in first-seen order.
fn record_ids(events: &[ResultEvent]) -> Vec<PropValue> {
    let mut ids = Vec::new();
    for event in events {
        if let Some(row) = event.as_record() {
            ids.extend(row_ids(row));
        }
    }
    dedupe(&mut ids);
    ids
}

fn row_ids(row: &Row) -> Vec<PropValue> {
    let mut out = Vec::new();
    for value in row.values() {
        match value {
            PropValue::Str(s) if s.starts_with(ID_PREFIX) => out.push(value.clone()),
            PropValue::Map(map) => {
                if let Some(PropValue::Str(s)) = map.get(ID_PROP) {
                    if s.starts_with(ID_PREFIX) {
                        out.push(PropValue::Str(s.clone()));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn dedupe(ids: &mut Vec<PropValue>) {
    let mut seen = HashSet::new();
    ids.retain(|v| match v.as_str() {
        Some(s) => seen.insert(s.to_owned()),
        None => false,
    });
}
