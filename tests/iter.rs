//! Iterated and recursive query drivers: round threading, hop budgets,
//! and the originator round-trip for recursive queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use plasma::expr::Expr;
use plasma::model::ROOT_ID;
use plasma::plan::PlanKind;
use plasma::{
    records, MemoryGraph, NodeId, PathQueryBuilder, Peer, PeerConfig, PropValue, ResultEvent,
    ROOT_PARAM,
};

/// root -[:friend]-> f1 -[:friend]-> f2 -[:friend]-> f3 -[:friend]-> f4
fn friend_chain(len: usize) -> (Arc<MemoryGraph>, Vec<NodeId>) {
    let graph = MemoryGraph::new();
    let mut ids = vec![NodeId::root()];
    let mut prev = NodeId::root();
    for i in 0..len {
        let n = graph.add(&[("hop", PropValue::Int(i as i64 + 1))]);
        graph.link(&prev, &n, "friend").unwrap();
        ids.push(n.clone());
        prev = n;
    }
    (Arc::new(graph), ids)
}

fn root_params() -> BTreeMap<String, PropValue> {
    let mut params = BTreeMap::new();
    params.insert(ROOT_PARAM.to_owned(), PropValue::from(ROOT_ID));
    params
}

fn bare_ids(events: &[ResultEvent]) -> Vec<String> {
    records(events)
        .iter()
        .filter_map(|row| row.get("f").and_then(PropValue::as_str).map(str::to_owned))
        .collect()
}

#[tokio::test]
async fn three_rounds_reach_the_distance_three_node() {
    let (graph, ids) = friend_chain(4);
    let peer = Peer::new(graph, PeerConfig::testing());
    let mut plan = peer
        .plan(
            &PathQueryBuilder::new()
                .segment("f", &["friend"])
                .project("f", &[])
                .build(),
        )
        .unwrap();
    plan.kind = PlanKind::IterNQuery;
    plan.iter_n = 3;
    plan.htl = 5;

    let events = peer.query(plan, root_params()).await.unwrap();
    assert_eq!(bare_ids(&events), vec![ids[3].as_str().to_owned()]);
}

#[tokio::test]
async fn exhausted_htl_yields_one_error_event() {
    let (graph, _) = friend_chain(4);
    let peer = Peer::new(graph, PeerConfig::testing());
    let mut plan = peer
        .plan(
            &PathQueryBuilder::new()
                .segment("f", &["friend"])
                .project("f", &[])
                .build(),
        )
        .unwrap();
    plan.kind = PlanKind::IterNQuery;
    plan.iter_n = 3;
    plan.htl = 2;

    let events = peer.query(plan, root_params()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].as_error().map(|e| e.code.as_str()),
        Some("htl-reached")
    );
}

#[tokio::test]
async fn iter_matches_manual_root_rebinding() {
    let (graph, _) = friend_chain(4);
    let peer = Peer::new(graph, PeerConfig::testing());
    let query = PathQueryBuilder::new()
        .segment("f", &["friend"])
        .project("f", &[])
        .build();

    // drive three single rounds by hand
    let mut seeds = root_params();
    let mut manual = Vec::new();
    for _ in 0..3 {
        let plan = peer.plan(&query).unwrap();
        let events = peer.query(plan, seeds.clone()).await.unwrap();
        manual = bare_ids(&events);
        let next: Vec<PropValue> = manual.iter().map(|s| PropValue::from(s.as_str())).collect();
        seeds.insert(ROOT_PARAM.to_owned(), PropValue::List(next));
    }

    let mut plan = peer.plan(&query).unwrap();
    plan.kind = PlanKind::IterNQuery;
    plan.iter_n = 3;
    plan.htl = 5;
    let driven = bare_ids(&peer.query(plan, root_params()).await.unwrap());
    assert_eq!(driven, manual);
}

/// Chain where the first two hops ask for more recursion and the third
/// says stop: cont=true, cont=true, cont=false.
fn cont_chain() -> Arc<MemoryGraph> {
    let graph = MemoryGraph::new();
    let mut prev = NodeId::root();
    for cont in [true, true, false] {
        let n = graph.add(&[("cont", PropValue::Bool(cont))]);
        graph.link(&prev, &n, "friend").unwrap();
        prev = n;
    }
    Arc::new(graph)
}

fn recur_plan(peer: &Peer) -> plasma::Plan {
    let mut plan = peer
        .plan(
            &PathQueryBuilder::new()
                .segment("f", &["friend"])
                .project("f", &["id", "cont"])
                .build(),
        )
        .unwrap();
    plan.kind = PlanKind::RecurQuery;
    plan.pred = Some(Expr::eq(Expr::prop("f", "cont"), Expr::lit(true)));
    plan.htl = 5;
    plan.seeds
        .insert(ROOT_PARAM.to_owned(), PropValue::from(ROOT_ID));
    plan
}

#[tokio::test]
async fn recur_recurses_until_the_predicate_says_stop() {
    let peer = Peer::new(cont_chain(), PeerConfig::testing());
    let plan = recur_plan(&peer);
    let events = peer.query(plan, BTreeMap::new()).await.unwrap();

    let rows = records(&events);
    assert_eq!(rows.len(), 1);
    let stop = match rows[0].get("f") {
        Some(PropValue::Map(map)) => map.get("cont"),
        _ => None,
    };
    assert_eq!(stop, Some(&PropValue::Bool(false)));
}

#[tokio::test]
async fn recur_with_tight_htl_reports_exhaustion() {
    let peer = Peer::new(cont_chain(), PeerConfig::testing());
    let mut plan = recur_plan(&peer);
    plan.htl = 2;
    let events = peer.query(plan, BTreeMap::new()).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.as_error().is_some_and(|err| err.code == "htl-reached")));
}

#[tokio::test]
async fn recur_result_travels_back_to_the_originator() {
    let callee = Arc::new(Peer::new(cont_chain(), PeerConfig::testing()));
    let callee_url = callee.serve().await.unwrap();

    let originator = Arc::new(Peer::new(
        Arc::new(MemoryGraph::new()),
        PeerConfig::testing(),
    ));
    originator.serve().await.unwrap();

    let plan = recur_plan(&callee);
    let events = originator
        .recur_query_remote(&callee_url, plan)
        .await
        .unwrap();
    let rows = records(&events);
    assert_eq!(rows.len(), 1);

    callee.close().await;
    originator.close().await;
}
