//! Cutting a transportable sub-plan out of a running plan.
//!
//! When a traverse operator lands on a proxy node, the portion of the
//! plan from that traverse through the root must run on the proxy's peer.
//! The cut operator's upstream is replaced by a fresh parameter seeded
//! with the remote node id; everything upstream of the cut falls away,
//! and the receive operator rides along so nested crossings on the remote
//! side merge their own sub-queries. Operator ids are preserved, which is
//! what makes merging local and remote tuples sound.

use crate::error::{PlasmaError, Result};
use crate::model::{NodeId, PropValue};
use crate::plan::{OpId, OpKind, OpNode, Plan, PlanKind, ROOT_PARAM};

/// Derives the sub-plan for a proxy crossing at `cut`, seeded with the
/// proxy's remote node id. The result is self-contained and shipped
/// verbatim; the remote peer executes it with the same runtime.
pub fn extract(plan: &Plan, cut: &OpId, seed: &NodeId) -> Result<Plan> {
    let cut_op = plan
        .op(cut)
        .ok_or_else(|| PlasmaError::PlanInvalid(format!("cut operator '{cut}' not in plan")))?;
    if !matches!(cut_op.kind, OpKind::Traverse { .. }) {
        return Err(PlasmaError::PlanInvalid(format!(
            "cut operator '{cut}' is not a traverse"
        )));
    }

    let mut sub = plan.clone();
    sub.kind = PlanKind::Query;
    sub.iter_n = 0;
    sub.pred = None;

    let param_id = sub.next_op_id();
    sub.ops.insert(
        param_id.clone(),
        OpNode {
            id: param_id.clone(),
            kind: OpKind::Parameter {
                name: ROOT_PARAM.to_owned(),
            },
            deps: Vec::new(),
        },
    );
    let rewired = sub.ops.get_mut(cut).expect("cut op cloned with the plan");
    rewired.deps = vec![param_id.clone()];
    if let OpKind::Traverse { src, .. } = &mut rewired.kind {
        *src = param_id.clone();
    }

    let keep = sub.reachable();
    sub.ops.retain(|id, _| keep.contains(id));
    sub.params.retain(|_, id| keep.contains(id));
    sub.pbind.retain(|_, id| keep.contains(id));
    sub.params.insert(ROOT_PARAM.to_owned(), param_id);
    sub.seeds
        .insert(ROOT_PARAM.to_owned(), PropValue::from(seed));

    sub.validate()?;
    Ok(sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PathQueryBuilder;
    use crate::plan::OpId;
    use crate::planner::{Planner, PlannerConfig};

    fn crossing_plan() -> Plan {
        let query = PathQueryBuilder::new()
            .segment("synth", &["net", "peer", "music", "synths", "synth"])
            .project("synth", &["label"])
            .build();
        Planner::new(PlannerConfig::default()).plan(&query).unwrap()
    }

    /// The traverse for the third hop (`music`), the first one executed
    /// on the remote side in the proxy scenario. The planner numbers the
    /// spine o0 (parameter) then o1..o5 (traverses).
    fn music_traverse() -> OpId {
        OpId::new("o3")
    }

    #[test]
    fn cut_rewires_the_traverse_to_a_fresh_parameter() {
        let plan = crossing_plan();
        let cut = music_traverse();
        let seed = NodeId::new("UUID:ROOT");
        let sub = extract(&plan, &cut, &seed).unwrap();

        let param_id = sub.params.get(ROOT_PARAM).unwrap();
        let cut_op = sub.op(&cut).unwrap();
        assert_eq!(cut_op.deps, vec![param_id.clone()]);
        if let OpKind::Traverse { src, .. } = &cut_op.kind {
            assert_eq!(src, param_id);
        } else {
            panic!("cut op must stay a traverse");
        }
        assert_eq!(
            sub.seeds.get(ROOT_PARAM),
            Some(&PropValue::from(&seed))
        );
    }

    #[test]
    fn pre_cut_operators_fall_away_and_the_tail_survives() {
        let plan = crossing_plan();
        let sub = extract(&plan, &music_traverse(), &NodeId::root()).unwrap();

        // the original parameter and the first two traverses are gone
        assert!(sub.op(&OpId::new("o0")).is_none());
        assert!(sub.op(&OpId::new("o1")).is_none());
        assert!(sub.op(&OpId::new("o2")).is_none());
        // the cut traverse, its successors, the receive, and the
        // projection machinery survive with their original ids
        for id in ["o3", "o4", "o5"] {
            assert!(sub.op(&OpId::new(id)).is_some(), "missing {id}");
        }
        assert!(sub.receive_op().is_some());
        assert!(sub.project_op().is_some());
        assert_eq!(sub.root, plan.root);
    }

    #[test]
    fn sub_plans_survive_the_wire_format() {
        let plan = crossing_plan();
        let sub = extract(&plan, &music_traverse(), &NodeId::root()).unwrap();
        let json = serde_json::to_string(&sub).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }

    #[test]
    fn cutting_at_a_non_traverse_is_fatal() {
        let plan = crossing_plan();
        let recv = plan.receive_op().unwrap().clone();
        let err = extract(&plan, &recv, &NodeId::root()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn shared_ids_merge_local_and_remote_tuples() {
        use crate::tuple::{PathTuple, Slot};
        let local = PathTuple::empty()
            .bind(&OpId::new("o1"), Slot::Node(NodeId::new("UUID:aaaa")))
            .bind(&OpId::new("o2"), Slot::Node(NodeId::new("UUID:bbbb")));
        let remote = PathTuple::empty()
            .bind(&OpId::new("o3"), Slot::Node(NodeId::new("UUID:cccc")));
        let merged = local.merge(&remote);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.node(&OpId::new("o1")), Some(&NodeId::new("UUID:aaaa")));
        assert_eq!(merged.node(&OpId::new("o3")), Some(&NodeId::new("UUID:cccc")));
    }
}
