// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Physical plans of installed dataflows.
//!
//! A [`PhysicalPlan`] is an arena of operators. Operators refer to their
//! inputs by arena index, and every input index is strictly smaller than the
//! index of the operator that reads it, which makes every valid plan a DAG
//! whose topological order is the arena order. The same [`PlanNode`] type is
//! used for the merged, cluster-wide plan built at seal time; there the arena
//! is shared by all dataflows of the cluster.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::GlobalId;
use crate::scalar::ScalarExpr;

/// How an arrangement distributes its records among workers.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Partitioning {
    /// Records are distributed by the hash of the arrangement key.
    Keyed,
    /// Records are distributed by the hash of these expressions.
    Hash(Vec<ScalarExpr>),
    /// All records live on a single worker.
    Single,
}

/// Aggregate functions supported by [`PlanNode::Reduce`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// The number of non-null values.
    Count,
    /// The sum of non-null integer values, or null if there are none.
    SumInt64,
    /// The least non-null value.
    Min,
    /// The greatest non-null value.
    Max,
}

/// An aggregate applied to each group of a reduction.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub func: AggregateFunc,
    pub expr: ScalarExpr,
    /// Whether to aggregate only distinct values.
    pub distinct: bool,
}

/// A physical operator.
///
/// The set of operators is closed; every consumer of plans (canonicalization,
/// content hashing, interpretation) matches exhaustively on it.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum PlanNode {
    /// Reads a collection maintained outside of the dataflow.
    Get { id: GlobalId },
    /// Retains the rows for which every predicate evaluates to true.
    Filter {
        input: usize,
        predicates: Vec<ScalarExpr>,
    },
    /// Appends one column per scalar. Each scalar may refer to the columns
    /// appended by the scalars before it.
    Map { input: usize, scalars: Vec<ScalarExpr> },
    /// Reorders, drops, or duplicates columns.
    Project { input: usize, outputs: Vec<usize> },
    /// Joins the inputs on the concatenation of their columns.
    ///
    /// Each equivalence class requires all of its expressions to evaluate to
    /// the same non-null value.
    Join {
        inputs: Vec<usize>,
        equivalences: Vec<Vec<ScalarExpr>>,
    },
    /// Groups by `group_key` and produces the key followed by one column per
    /// aggregate.
    Reduce {
        input: usize,
        group_key: Vec<ScalarExpr>,
        aggregates: Vec<AggregateExpr>,
    },
    /// Maintains an arrangement of the input indexed by `key`.
    ///
    /// `key` and `partitioning` refer to the columns of the input. The
    /// arrangement retains the input columns listed in `projection`, in order.
    ArrangeBy {
        input: usize,
        key: Vec<ScalarExpr>,
        partitioning: Partitioning,
        projection: Vec<usize>,
    },
    /// The multiset union of the inputs.
    Union { inputs: Vec<usize> },
}

impl PlanNode {
    /// The arena indexes of the node's inputs.
    pub fn inputs(&self) -> Vec<usize> {
        match self {
            PlanNode::Get { .. } => vec![],
            PlanNode::Filter { input, .. }
            | PlanNode::Map { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Reduce { input, .. }
            | PlanNode::ArrangeBy { input, .. } => vec![*input],
            PlanNode::Join { inputs, .. } | PlanNode::Union { inputs } => inputs.clone(),
        }
    }

    /// Rewrites each input index with `f`.
    pub fn map_inputs<F: FnMut(usize) -> usize>(&mut self, mut f: F) {
        match self {
            PlanNode::Get { .. } => {}
            PlanNode::Filter { input, .. }
            | PlanNode::Map { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Reduce { input, .. }
            | PlanNode::ArrangeBy { input, .. } => *input = f(*input),
            PlanNode::Join { inputs, .. } | PlanNode::Union { inputs } => {
                for input in inputs.iter_mut() {
                    *input = f(*input);
                }
            }
        }
    }

    /// Calls `f` on every scalar expression the node evaluates.
    pub fn visit_scalars<'a, F: FnMut(&'a ScalarExpr)>(&'a self, mut f: F) {
        match self {
            PlanNode::Get { .. } | PlanNode::Project { .. } | PlanNode::Union { .. } => {}
            PlanNode::Filter { predicates, .. } => predicates.iter().for_each(f),
            PlanNode::Map { scalars, .. } => scalars.iter().for_each(f),
            PlanNode::Join { equivalences, .. } => equivalences.iter().flatten().for_each(f),
            PlanNode::Reduce {
                group_key,
                aggregates,
                ..
            } => {
                group_key.iter().for_each(&mut f);
                aggregates.iter().map(|a| &a.expr).for_each(f);
            }
            PlanNode::ArrangeBy {
                key, partitioning, ..
            } => {
                key.iter().for_each(&mut f);
                if let Partitioning::Hash(exprs) = partitioning {
                    exprs.iter().for_each(f);
                }
            }
        }
    }

    /// Reports whether the node produces the same output whenever it is given
    /// the same inputs.
    pub fn is_deterministic(&self) -> bool {
        let mut deterministic = true;
        self.visit_scalars(|e| deterministic &= e.is_deterministic());
        deterministic
    }

    /// Reports whether the node maintains an arrangement.
    pub fn is_arrangement(&self) -> bool {
        matches!(self, PlanNode::ArrangeBy { .. })
    }

    /// A short name for the operator, for logging and explanations.
    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::Get { .. } => "Get",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Map { .. } => "Map",
            PlanNode::Project { .. } => "Project",
            PlanNode::Join { .. } => "Join",
            PlanNode::Reduce { .. } => "Reduce",
            PlanNode::ArrangeBy { .. } => "ArrangeBy",
            PlanNode::Union { .. } => "Union",
        }
    }

    /// Rewrites the node into its canonical form.
    ///
    /// Canonicalization never changes the node's output. Beyond canonicalizing
    /// every scalar, it
    ///  * splits conjunctive filter predicates and sorts and deduplicates them,
    ///  * sorts and deduplicates join equivalence classes and their members,
    ///  * replaces hash partitioning on exactly the arrangement key by
    ///    [`Partitioning::Keyed`], and
    ///  * sorts the inputs of a union.
    ///
    /// Input order of joins and column order of keys, maps, and projections
    /// carry meaning and are left alone.
    pub fn canonicalize(&mut self) {
        match self {
            PlanNode::Get { .. } | PlanNode::Project { .. } => {}
            PlanNode::Filter { predicates, .. } => {
                let mut split = Vec::with_capacity(predicates.len());
                for mut predicate in predicates.drain(..) {
                    predicate.canonicalize();
                    match predicate {
                        ScalarExpr::CallVariadic {
                            func: crate::scalar::VariadicFunc::And,
                            exprs,
                        } => split.extend(exprs),
                        other => split.push(other),
                    }
                }
                sort_dedup(&mut split);
                *predicates = split;
            }
            PlanNode::Map { scalars, .. } => scalars.iter_mut().for_each(ScalarExpr::canonicalize),
            PlanNode::Join { equivalences, .. } => {
                for class in equivalences.iter_mut() {
                    class.iter_mut().for_each(ScalarExpr::canonicalize);
                    sort_dedup(class);
                }
                equivalences.sort();
                equivalences.dedup();
            }
            PlanNode::Reduce {
                group_key,
                aggregates,
                ..
            } => {
                group_key.iter_mut().for_each(ScalarExpr::canonicalize);
                for aggregate in aggregates.iter_mut() {
                    aggregate.expr.canonicalize();
                }
            }
            PlanNode::ArrangeBy {
                key, partitioning, ..
            } => {
                key.iter_mut().for_each(ScalarExpr::canonicalize);
                if let Partitioning::Hash(exprs) = partitioning {
                    exprs.iter_mut().for_each(ScalarExpr::canonicalize);
                    if exprs == key {
                        *partitioning = Partitioning::Keyed;
                    }
                }
            }
            PlanNode::Union { inputs } => inputs.sort(),
        }
    }
}

/// Sorts `exprs` and removes duplicates, unless removing a duplicate could
/// drop an independent evaluation of a non-deterministic function.
fn sort_dedup(exprs: &mut Vec<ScalarExpr>) {
    exprs.sort();
    if exprs.iter().all(|e| e.is_deterministic()) {
        exprs.dedup();
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }
        match self {
            PlanNode::Get { id } => write!(f, "Get {}", id),
            PlanNode::Filter { input, predicates } => {
                write!(f, "Filter %{} (", input)?;
                list(f, predicates)?;
                f.write_str(")")
            }
            PlanNode::Map { input, scalars } => {
                write!(f, "Map %{} (", input)?;
                list(f, scalars)?;
                f.write_str(")")
            }
            PlanNode::Project { input, outputs } => {
                write!(f, "Project %{} (", input)?;
                list(f, outputs)?;
                f.write_str(")")
            }
            PlanNode::Join {
                inputs,
                equivalences,
            } => {
                f.write_str("Join ")?;
                for (i, input) in inputs.iter().enumerate() {
                    write!(f, "{}%{}", if i > 0 { ", " } else { "" }, input)?;
                }
                for class in equivalences {
                    f.write_str(" [")?;
                    list(f, class)?;
                    f.write_str("]")?;
                }
                Ok(())
            }
            PlanNode::Reduce {
                input,
                group_key,
                aggregates,
            } => {
                write!(f, "Reduce %{} key=(", input)?;
                list(f, group_key)?;
                write!(f, ") aggregates={}", aggregates.len())
            }
            PlanNode::ArrangeBy {
                input,
                key,
                partitioning,
                projection,
            } => {
                write!(f, "ArrangeBy %{} key=(", input)?;
                list(f, key)?;
                write!(f, ") {:?} project=(", partitioning)?;
                list(f, projection)?;
                f.write_str(")")
            }
            PlanNode::Union { inputs } => {
                f.write_str("Union ")?;
                for (i, input) in inputs.iter().enumerate() {
                    write!(f, "{}%{}", if i > 0 { ", " } else { "" }, input)?;
                }
                Ok(())
            }
        }
    }
}

/// How urgently readers need a node's output, relative to other nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum LatencyClass {
    /// Serves interactive reads; spilling it hurts.
    Interactive,
    Standard,
    /// Readers tolerate staleness and slow lookups.
    Tolerant,
}

impl LatencyClass {
    /// The multiplier the memory budgeter applies to the node's access
    /// frequency.
    pub fn sensitivity(&self) -> u64 {
        match self {
            LatencyClass::Interactive => 4,
            LatencyClass::Standard => 2,
            LatencyClass::Tolerant => 1,
        }
    }
}

/// Resource estimates attached to a node by the planner or measured by the
/// runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResourceHint {
    /// Estimated or measured resident size, in bytes. Stateless operators
    /// report zero.
    pub size_bytes: u64,
    /// Estimated reads per second.
    pub access_frequency: u64,
    pub latency: LatencyClass,
    /// Whether the node's state may live in secondary storage.
    pub spillable: bool,
}

impl Default for ResourceHint {
    fn default() -> Self {
        ResourceHint {
            size_bytes: 0,
            access_frequency: 0,
            latency: LatencyClass::Standard,
            spillable: true,
        }
    }
}

impl ResourceHint {
    /// A hint for a stateful node of the given size.
    pub fn sized(size_bytes: u64) -> Self {
        ResourceHint {
            size_bytes,
            ..Default::default()
        }
    }

    /// Combines the hints of two nodes that are merged into one: the state is
    /// kept once, its readers add up, and the strictest latency requirement
    /// and spill restriction win.
    pub fn merge(&self, other: &ResourceHint) -> ResourceHint {
        ResourceHint {
            size_bytes: self.size_bytes.max(other.size_bytes),
            access_frequency: self.access_frequency.saturating_add(other.access_frequency),
            latency: self.latency.min(other.latency),
            spillable: self.spillable && other.spillable,
        }
    }
}

/// An operator together with its resource estimates.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PhysicalNode {
    pub op: PlanNode,
    pub hint: ResourceHint,
}

/// Errors describing a structurally invalid plan.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no operators")]
    Empty,
    #[error("plan root {root} is out of bounds")]
    RootOutOfBounds { root: usize },
    #[error("operator {node} reads operator {input}, which is not ahead of it")]
    ForwardReference { node: usize, input: usize },
    #[error("operator {node} has no inputs")]
    NoInputs { node: usize },
}

/// The physical plan of a single dataflow.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub nodes: Vec<PhysicalNode>,
    pub root: usize,
}

impl PhysicalPlan {
    /// Returns a builder for a new plan.
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }

    /// Checks that the plan is a well-formed DAG.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::Empty);
        }
        if self.root >= self.nodes.len() {
            return Err(PlanError::RootOutOfBounds { root: self.root });
        }
        for (node, physical) in self.nodes.iter().enumerate() {
            let inputs = physical.op.inputs();
            if inputs.is_empty() && !matches!(physical.op, PlanNode::Get { .. }) {
                return Err(PlanError::NoInputs { node });
            }
            if let Some(input) = inputs.into_iter().find(|input| *input >= node) {
                return Err(PlanError::ForwardReference { node, input });
            }
        }
        Ok(())
    }

    /// The sum of the resident sizes of every node, as if every node were kept
    /// in memory.
    pub fn total_size_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.hint.size_bytes)
            .fold(0, u64::saturating_add)
    }

    /// The collections the plan reads.
    pub fn depends_on(&self) -> std::collections::BTreeSet<GlobalId> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.op {
                PlanNode::Get { id } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// Builds a [`PhysicalPlan`] bottom-up.
///
/// Every method appends one operator and returns its index; the last operator
/// added becomes the root.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    nodes: Vec<PhysicalNode>,
}

impl PlanBuilder {
    /// Appends `op` with `hint`.
    pub fn push(&mut self, op: PlanNode, hint: ResourceHint) -> usize {
        self.nodes.push(PhysicalNode { op, hint });
        self.nodes.len() - 1
    }

    pub fn get(&mut self, id: GlobalId) -> usize {
        self.push(PlanNode::Get { id }, ResourceHint::default())
    }

    pub fn filter(&mut self, input: usize, predicates: Vec<ScalarExpr>) -> usize {
        self.push(PlanNode::Filter { input, predicates }, ResourceHint::default())
    }

    pub fn map(&mut self, input: usize, scalars: Vec<ScalarExpr>) -> usize {
        self.push(PlanNode::Map { input, scalars }, ResourceHint::default())
    }

    pub fn project(&mut self, input: usize, outputs: Vec<usize>) -> usize {
        self.push(PlanNode::Project { input, outputs }, ResourceHint::default())
    }

    pub fn join(
        &mut self,
        inputs: Vec<usize>,
        equivalences: Vec<Vec<ScalarExpr>>,
        hint: ResourceHint,
    ) -> usize {
        self.push(
            PlanNode::Join {
                inputs,
                equivalences,
            },
            hint,
        )
    }

    pub fn reduce(
        &mut self,
        input: usize,
        group_key: Vec<ScalarExpr>,
        aggregates: Vec<AggregateExpr>,
        hint: ResourceHint,
    ) -> usize {
        self.push(
            PlanNode::Reduce {
                input,
                group_key,
                aggregates,
            },
            hint,
        )
    }

    pub fn arrange_by(
        &mut self,
        input: usize,
        key: Vec<ScalarExpr>,
        partitioning: Partitioning,
        projection: Vec<usize>,
        hint: ResourceHint,
    ) -> usize {
        self.push(
            PlanNode::ArrangeBy {
                input,
                key,
                partitioning,
                projection,
            },
            hint,
        )
    }

    pub fn union(&mut self, inputs: Vec<usize>) -> usize {
        self.push(PlanNode::Union { inputs }, ResourceHint::default())
    }

    /// Finishes the plan, rooted at the most recently added operator.
    pub fn finish(self) -> PhysicalPlan {
        let root = self.nodes.len().saturating_sub(1);
        PhysicalPlan {
            nodes: self.nodes,
            root,
        }
    }
}
