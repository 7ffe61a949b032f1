// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Detection of arrangements that dataflows can share.
//!
//! Two arrangement requests are shareable when they arrange the same
//! collection by the same canonical key with the same canonical partitioning.
//! Requests that agree on all three but retain different columns are still
//! shared: the shared arrangement retains the union of the columns, and each
//! request reads it through a projection that restores the columns it asked
//! for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::id::GlobalId;
use crate::plan::{Partitioning, PhysicalNode, PhysicalPlan, PlanNode, ResourceHint};
use crate::registry::Dataflow;
use crate::scalar::ScalarExpr;

/// The canonical identity of an arrangement request.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArrangementKey {
    /// The collection being arranged.
    pub collection: GlobalId,
    /// The canonicalized key expressions, in key order.
    pub key: Vec<ScalarExpr>,
    pub partitioning: Partitioning,
}

impl ArrangementKey {
    /// Computes the key of the arrangement at `node` of `plan`.
    ///
    /// Returns `None` if the node is not an arrangement of a collection read
    /// directly by the plan, or if its key or partitioning is not
    /// deterministic. Arrangements of derived inputs are left to common
    /// sub-expression elimination, which shares them once their inputs are
    /// shared.
    pub fn of(plan: &PhysicalPlan, node: usize) -> Option<ArrangementKey> {
        let physical = plan.nodes.get(node)?;
        if !physical.op.is_deterministic() {
            return None;
        }
        let mut op = physical.op.clone();
        op.canonicalize();
        match op {
            PlanNode::ArrangeBy {
                input,
                key,
                partitioning,
                ..
            } => match plan.nodes.get(input).map(|n| &n.op) {
                Some(PlanNode::Get { id }) => Some(ArrangementKey {
                    collection: *id,
                    key,
                    partitioning,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One arrangement request within a dataflow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArrangementRequest {
    pub dataflow: GlobalId,
    /// The index of the `ArrangeBy` in the dataflow's plan.
    pub node: usize,
    /// The columns the request retains.
    pub projection: Vec<usize>,
    pub hint: ResourceHint,
}

/// Arrangement requests that will be served by a single shared arrangement.
#[derive(Clone, Debug)]
pub struct SharingGroup {
    pub key: ArrangementKey,
    pub members: Vec<ArrangementRequest>,
    /// The dataflows that will read the shared arrangement.
    pub consumers: BTreeSet<GlobalId>,
    /// The columns the shared arrangement retains: the sorted union of the
    /// members' projections.
    pub projection: Vec<usize>,
}

impl SharingGroup {
    /// The bytes saved by keeping one arrangement instead of one per member.
    pub fn estimated_savings_bytes(&self) -> u64 {
        let total = self
            .members
            .iter()
            .map(|m| m.hint.size_bytes)
            .fold(0, u64::saturating_add);
        let kept = self
            .members
            .iter()
            .map(|m| m.hint.size_bytes)
            .max()
            .unwrap_or(0);
        total - kept
    }
}

/// The result of arrangement sharing analysis.
#[derive(Clone, Debug, Default)]
pub struct SharingPlan {
    pub groups: BTreeMap<ArrangementKey, SharingGroup>,
}

impl SharingPlan {
    /// Groups the arrangement requests of `dataflows`.
    ///
    /// Every group with more than one member is a sharing opportunity.
    /// Requests with distinct keys never end up in the same group.
    pub fn analyze(dataflows: &[Arc<Dataflow>]) -> SharingPlan {
        let mut requests: BTreeMap<ArrangementKey, Vec<ArrangementRequest>> = BTreeMap::new();
        for dataflow in dataflows {
            for (node, physical) in dataflow.plan.nodes.iter().enumerate() {
                let PlanNode::ArrangeBy { projection, .. } = &physical.op else {
                    continue;
                };
                if let Some(key) = ArrangementKey::of(&dataflow.plan, node) {
                    requests.entry(key).or_default().push(ArrangementRequest {
                        dataflow: dataflow.id,
                        node,
                        projection: projection.clone(),
                        hint: physical.hint,
                    });
                }
            }
        }

        let groups: BTreeMap<_, _> = requests
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, members)| {
                let consumers = members.iter().map(|m| m.dataflow).collect();
                let projection = members
                    .iter()
                    .flat_map(|m| m.projection.iter().copied())
                    .sorted()
                    .dedup()
                    .collect();
                let group = SharingGroup {
                    key: key.clone(),
                    members,
                    consumers,
                    projection,
                };
                (key, group)
            })
            .collect();

        for group in groups.values() {
            debug!(
                collection = %group.key.collection,
                consumers = group.consumers.len(),
                members = group.members.len(),
                savings_bytes = group.estimated_savings_bytes(),
                "found shareable arrangement"
            );
        }
        SharingPlan { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// The dataflows to rewire onto each shared arrangement.
    pub fn consumers(&self) -> BTreeMap<ArrangementKey, BTreeSet<GlobalId>> {
        self.groups
            .iter()
            .map(|(key, group)| (key.clone(), group.consumers.clone()))
            .collect()
    }

    /// The bytes saved across all groups.
    pub fn estimated_savings_bytes(&self) -> u64 {
        self.groups
            .values()
            .map(SharingGroup::estimated_savings_bytes)
            .fold(0, u64::saturating_add)
    }

    /// Rewrites the plans of `dataflows` so that the members of each group
    /// request identical arrangements.
    ///
    /// Each member is widened to the group's projection. If that changes the
    /// columns the member produces, a `Project` is placed after it that
    /// restores them, so the dataflow's output is unchanged.
    pub fn rewrite(&self, dataflows: &[Arc<Dataflow>]) -> Vec<(GlobalId, PhysicalPlan)> {
        let mut widen: BTreeMap<(GlobalId, usize), &Vec<usize>> = BTreeMap::new();
        for group in self.groups.values() {
            for member in &group.members {
                widen.insert((member.dataflow, member.node), &group.projection);
            }
        }

        dataflows
            .iter()
            .map(|dataflow| {
                let plan = &dataflow.plan;
                let mut nodes: Vec<PhysicalNode> = Vec::with_capacity(plan.nodes.len());
                let mut remap: Vec<usize> = Vec::with_capacity(plan.nodes.len());
                for (index, physical) in plan.nodes.iter().enumerate() {
                    let mut op = physical.op.clone();
                    op.map_inputs(|i| remap[i]);
                    // The columns to restore after widening, if widening
                    // changes them.
                    let mut restore = None;
                    if let (PlanNode::ArrangeBy { projection, .. }, Some(shared)) =
                        (&mut op, widen.get(&(dataflow.id, index)))
                    {
                        if projection != *shared {
                            let outputs: Vec<usize> = projection
                                .iter()
                                .map(|c| {
                                    shared
                                        .binary_search(c)
                                        .expect("shared projection covers every member")
                                })
                                .collect();
                            *projection = Vec::clone(shared);
                            restore = Some(outputs);
                        }
                    }
                    nodes.push(PhysicalNode {
                        op,
                        hint: physical.hint,
                    });
                    if let Some(outputs) = restore {
                        nodes.push(PhysicalNode {
                            op: PlanNode::Project {
                                input: nodes.len() - 1,
                                outputs,
                            },
                            hint: ResourceHint::default(),
                        });
                    }
                    remap.push(nodes.len() - 1);
                }
                let root = remap[plan.root];
                (dataflow.id, PhysicalPlan { nodes, root })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use timely::progress::Antichain;

    use super::*;
    use crate::eval::{consolidate, evaluate_plan};
    use crate::scalar::{Datum, EvalContext};

    const ORDERS: GlobalId = GlobalId::User(1);
    const CUSTOMERS: GlobalId = GlobalId::User(2);

    fn arranged(id: u64, collection: GlobalId, key: usize, projection: Vec<usize>) -> Arc<Dataflow> {
        let mut builder = PhysicalPlan::builder();
        let get = builder.get(collection);
        builder.arrange_by(
            get,
            vec![ScalarExpr::column(key)],
            Partitioning::Keyed,
            projection,
            ResourceHint::sized(300),
        );
        Arc::new(Dataflow::new(
            GlobalId::User(id),
            format!("df{}", id),
            builder.finish(),
            Antichain::from_elem(0),
        ))
    }

    #[test]
    fn test_equal_requests_group_together() {
        let dataflows = vec![
            arranged(10, ORDERS, 1, vec![0, 1, 2]),
            arranged(11, ORDERS, 1, vec![0, 1, 2]),
            arranged(12, ORDERS, 1, vec![0, 1, 2]),
        ];
        let plan = SharingPlan::analyze(&dataflows);
        assert_eq!(plan.len(), 1);
        let group = plan.groups.values().next().unwrap();
        assert_eq!(group.consumers.len(), 3);
        assert_eq!(plan.estimated_savings_bytes(), 600);
    }

    #[test]
    fn test_unrelated_requests_stay_apart() {
        let dataflows = vec![
            arranged(10, ORDERS, 1, vec![0, 1]),
            arranged(11, ORDERS, 2, vec![0, 1]),
            arranged(12, CUSTOMERS, 1, vec![0, 1]),
        ];
        assert!(SharingPlan::analyze(&dataflows).is_empty());
    }

    #[test]
    fn test_hash_partitioning_on_key_matches_keyed() {
        let mut builder = PhysicalPlan::builder();
        let get = builder.get(ORDERS);
        builder.arrange_by(
            get,
            vec![ScalarExpr::column(1)],
            Partitioning::Hash(vec![ScalarExpr::column(1)]),
            vec![0, 1],
            ResourceHint::sized(300),
        );
        let hashed = Arc::new(Dataflow::new(
            GlobalId::User(20),
            "hashed",
            builder.finish(),
            Antichain::from_elem(0),
        ));
        let dataflows = vec![arranged(10, ORDERS, 1, vec![0, 1]), hashed];
        assert_eq!(SharingPlan::analyze(&dataflows).len(), 1);
    }

    #[test]
    fn test_widest_projection_is_shared() {
        let dataflows = vec![
            arranged(10, ORDERS, 1, vec![1, 0]),
            arranged(11, ORDERS, 1, vec![1, 2]),
        ];
        let plan = SharingPlan::analyze(&dataflows);
        let group = plan.groups.values().next().unwrap();
        assert_eq!(group.projection, vec![0, 1, 2]);

        let rewritten = plan.rewrite(&dataflows);
        let inputs = BTreeMap::from([(
            ORDERS,
            consolidate(vec![
                (vec![Datum::Int64(1), Datum::Int64(7), Datum::from("x")], 1),
                (vec![Datum::Int64(2), Datum::Int64(8), Datum::from("y")], 1),
            ]),
        )]);
        let ctx = EvalContext::default();
        for (dataflow, (id, plan)) in dataflows.iter().zip(rewritten.iter()) {
            assert_eq!(dataflow.id, *id);
            // Both members now arrange the same columns.
            assert!(plan.nodes.iter().any(|n| matches!(
                &n.op,
                PlanNode::ArrangeBy { projection, .. } if projection == &vec![0, 1, 2]
            )));
            assert_eq!(
                evaluate_plan(&dataflow.plan, &inputs, &ctx),
                evaluate_plan(plan, &inputs, &ctx)
            );
        }
    }

    #[test]
    fn test_nondeterministic_key_is_not_shared() {
        let key = vec![ScalarExpr::CallUnmaterializable(
            crate::scalar::UnmaterializableFunc::Random,
        )];
        let dataflows: Vec<_> = (0..2)
            .map(|i| {
                let mut builder = PhysicalPlan::builder();
                let get = builder.get(ORDERS);
                builder.arrange_by(
                    get,
                    key.clone(),
                    Partitioning::Keyed,
                    vec![0],
                    ResourceHint::sized(1),
                );
                Arc::new(Dataflow::new(
                    GlobalId::User(i),
                    "random",
                    builder.finish(),
                    Antichain::from_elem(0),
                ))
            })
            .collect();
        assert!(SharingPlan::analyze(&dataflows).is_empty());
    }
}
