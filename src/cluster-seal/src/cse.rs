// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Common sub-expression elimination across the dataflows of a cluster.
//!
//! Every dataflow plan is interned, bottom-up, into a single arena. An
//! operator is first canonicalized and its inputs are replaced by the arena
//! slots they were interned at; the result is content-addressed by a
//! `seahash` over the operator kind, its parameters, and its input slots.
//! Operators with equal content describe the same computation over the same
//! inputs and share one slot.
//!
//! Hash buckets are always confirmed by comparing operators, so a hash
//! collision never merges different computations. Operators that evaluate
//! non-deterministic functions are never interned: they, and everything
//! computed from them, get a slot of their own per occurrence.
//!
//! Merging is purely physical. Evaluating any dataflow from its root slot in
//! the merged plan produces exactly what its own plan produces.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::OptimizationError;
use crate::id::GlobalId;
use crate::plan::{PhysicalPlan, PlanNode, ResourceHint};

/// A slot of the merged plan.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MergedNode {
    /// The canonical operator. Its inputs are slots of the merged plan.
    pub op: PlanNode,
    /// The merged resource estimates of every occurrence of the operator.
    pub hint: ResourceHint,
    pub content_hash: u64,
    /// The dataflows whose output depends on this slot.
    pub consumers: BTreeSet<GlobalId>,
}

/// A physical plan for all dataflows of a cluster, with common
/// sub-computations shared.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergedPlan {
    pub nodes: Vec<MergedNode>,
    /// The slot producing the output of each dataflow.
    pub roots: BTreeMap<GlobalId, usize>,
}

impl MergedPlan {
    /// The slots that maintain arrangements, with the dataflows reading them.
    pub fn arrangements(&self) -> impl Iterator<Item = (usize, &MergedNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.op.is_arrangement())
    }

    /// The arrangements read by more than one dataflow.
    pub fn shared_arrangements(&self) -> impl Iterator<Item = (usize, &MergedNode)> {
        self.arrangements()
            .filter(|(_, node)| node.consumers.len() > 1)
    }

    /// The sum of the resident sizes of every slot.
    pub fn total_size_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.hint.size_bytes)
            .fold(0, u64::saturating_add)
    }

    /// The operator at `slot`, if any.
    pub fn op(&self, slot: usize) -> Option<&PlanNode> {
        self.nodes.get(slot).map(|n| &n.op)
    }

    /// Checks the structural invariants of the merged plan.
    ///
    /// Every input must live in an earlier slot, which rules out cycles, every
    /// dataflow's root must exist, and every arrangement must be read by some
    /// dataflow.
    pub fn validate(&self) -> Result<(), OptimizationError> {
        for (node, merged) in self.nodes.iter().enumerate() {
            if let Some(input) = merged.op.inputs().into_iter().find(|i| *i >= node) {
                return Err(OptimizationError::Cycle { node, input });
            }
            if merged.op.is_arrangement() && merged.consumers.is_empty() {
                return Err(OptimizationError::OrphanedArrangement(node));
            }
        }
        for (id, root) in &self.roots {
            if *root >= self.nodes.len() {
                return Err(OptimizationError::MissingRoot(*id));
            }
        }
        Ok(())
    }

    /// Renders the plan, one slot per line.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        for (slot, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(
                out,
                "%{} = {} // consumers=[{}] bytes={}",
                slot,
                node.op,
                node.consumers.iter().join(", "),
                node.hint.size_bytes
            );
        }
        for (id, root) in &self.roots {
            let _ = writeln!(out, "{} -> %{}", id, root);
        }
        out
    }
}

/// Summary of one merge, for logging and metrics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeStats {
    /// Operators across all input plans.
    pub input_nodes: usize,
    /// Slots in the merged plan.
    pub merged_nodes: usize,
    /// Slots read by more than one dataflow.
    pub shared_nodes: usize,
}

/// Builds a [`MergedPlan`] by interning dataflow plans.
#[derive(Debug)]
pub struct CrossDataflowOptimizer {
    /// Whether to share equal operators. When disabled, every operator gets a
    /// slot of its own and the merged plan is the disjoint union of the
    /// input plans.
    share: bool,
    nodes: Vec<MergedNode>,
    buckets: HashMap<u64, Vec<usize>>,
    roots: BTreeMap<GlobalId, usize>,
    input_nodes: usize,
}

impl CrossDataflowOptimizer {
    pub fn new(share: bool) -> Self {
        CrossDataflowOptimizer {
            share,
            nodes: Vec::new(),
            buckets: HashMap::new(),
            roots: BTreeMap::new(),
            input_nodes: 0,
        }
    }

    /// Merges the plans in order.
    pub fn merge<'a, I>(plans: I, share: bool) -> (MergedPlan, MergeStats)
    where
        I: IntoIterator<Item = (GlobalId, &'a PhysicalPlan)>,
    {
        let mut optimizer = CrossDataflowOptimizer::new(share);
        for (id, plan) in plans {
            optimizer.add_plan(id, plan);
        }
        optimizer.finish()
    }

    /// Interns every operator of `plan` and records its root for dataflow
    /// `id`. Returns the root slot.
    pub fn add_plan(&mut self, id: GlobalId, plan: &PhysicalPlan) -> usize {
        let mut slots: Vec<usize> = Vec::with_capacity(plan.nodes.len());
        for physical in &plan.nodes {
            let mut op = physical.op.clone();
            op.map_inputs(|i| slots[i]);
            op.canonicalize();
            let slot = self.intern(op, physical.hint);
            slots.push(slot);
        }
        self.input_nodes += plan.nodes.len();
        let root = slots[plan.root];
        self.roots.insert(id, root);
        root
    }

    fn intern(&mut self, op: PlanNode, hint: ResourceHint) -> usize {
        let content_hash = content_hash(&op);
        let shareable = self.share && op.is_deterministic();
        if shareable {
            if let Some(bucket) = self.buckets.get(&content_hash) {
                for slot in bucket {
                    let existing = &mut self.nodes[*slot];
                    if existing.op == op {
                        existing.hint = existing.hint.merge(&hint);
                        return *slot;
                    }
                }
            }
        }
        let slot = self.nodes.len();
        self.nodes.push(MergedNode {
            op,
            hint,
            content_hash,
            consumers: BTreeSet::new(),
        });
        if shareable {
            self.buckets.entry(content_hash).or_default().push(slot);
        }
        slot
    }

    /// Computes consumer sets and returns the merged plan.
    pub fn finish(mut self) -> (MergedPlan, MergeStats) {
        for (id, root) in &self.roots {
            self.nodes[*root].consumers.insert(*id);
        }
        // Inputs precede their readers, so a reverse sweep sees every reader
        // of a slot before the slot itself.
        for slot in (0..self.nodes.len()).rev() {
            let consumers = self.nodes[slot].consumers.clone();
            for input in self.nodes[slot].op.inputs() {
                self.nodes[input].consumers.extend(consumers.iter().copied());
            }
        }

        let plan = MergedPlan {
            nodes: self.nodes,
            roots: self.roots,
        };
        let stats = MergeStats {
            input_nodes: self.input_nodes,
            merged_nodes: plan.nodes.len(),
            shared_nodes: plan.nodes.iter().filter(|n| n.consumers.len() > 1).count(),
        };
        info!(
            input_nodes = stats.input_nodes,
            merged_nodes = stats.merged_nodes,
            shared_nodes = stats.shared_nodes,
            "merged dataflow plans"
        );
        debug!("merged plan:\n{}", plan.explain());
        (plan, stats)
    }
}

/// The content hash of an operator whose inputs are already interned.
pub fn content_hash(op: &PlanNode) -> u64 {
    let mut hasher = SeaHasher::new();
    op.hash(&mut hasher);
    hasher.finish()
}
