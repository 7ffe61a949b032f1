// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A reference interpreter for physical plans.
//!
//! The interpreter evaluates a plan against a static snapshot of its input
//! collections with multiset semantics. It exists to state, and to test, the
//! law that cross-dataflow merging is a physical deduplication only: every
//! dataflow evaluates to the same collection whether it runs from its own
//! plan or from its root in the merged plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::id::GlobalId;
use crate::plan::{AggregateExpr, AggregateFunc, PhysicalPlan, PlanNode};
use crate::scalar::{Datum, EvalContext, Row};

/// The multiplicity of a row.
pub type Diff = i64;

/// A consolidated multiset of rows. Rows with zero multiplicity are absent.
pub type Collection = BTreeMap<Row, Diff>;

/// Errors raised by the interpreter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("no input provided for collection {0}")]
    MissingInput(GlobalId),
    #[error("operator {0} is not part of the plan")]
    MissingNode(usize),
}

/// Builds a consolidated collection from `(row, diff)` pairs.
pub fn consolidate<I: IntoIterator<Item = (Row, Diff)>>(updates: I) -> Collection {
    let mut collection = Collection::new();
    for (row, diff) in updates {
        *collection.entry(row).or_insert(0) += diff;
    }
    collection.retain(|_, diff| *diff != 0);
    collection
}

/// Evaluates the plan of a single dataflow.
pub fn evaluate_plan(
    plan: &PhysicalPlan,
    inputs: &BTreeMap<GlobalId, Collection>,
    ctx: &EvalContext,
) -> Result<Collection, EvalError> {
    evaluate(|i| plan.nodes.get(i).map(|n| &n.op), plan.root, inputs, ctx)
}

/// Evaluates the operator at `root` of an arena addressed by `node`.
///
/// Every operator reachable from `root` is evaluated exactly once, in arena
/// order, so an operator read by several others is computed a single time.
pub fn evaluate<'a, F>(
    node: F,
    root: usize,
    inputs: &BTreeMap<GlobalId, Collection>,
    ctx: &EvalContext,
) -> Result<Collection, EvalError>
where
    F: Fn(usize) -> Option<&'a PlanNode>,
{
    let mut reachable = BTreeSet::new();
    let mut todo = vec![root];
    while let Some(index) = todo.pop() {
        if reachable.insert(index) {
            let op = node(index).ok_or(EvalError::MissingNode(index))?;
            todo.extend(op.inputs());
        }
    }

    let mut results: BTreeMap<usize, Collection> = BTreeMap::new();
    for index in reachable {
        let op = node(index).ok_or(EvalError::MissingNode(index))?;
        let input = |i: usize| results.get(&i).ok_or(EvalError::MissingNode(i));
        let output = match op {
            PlanNode::Get { id } => inputs
                .get(id)
                .cloned()
                .ok_or(EvalError::MissingInput(*id))?,
            PlanNode::Filter { input: i, predicates } => input(*i)?
                .iter()
                .filter(|(row, _)| predicates.iter().all(|p| p.eval(row, ctx) == Datum::True))
                .map(|(row, diff)| (row.clone(), *diff))
                .collect(),
            PlanNode::Map { input: i, scalars } => consolidate(input(*i)?.iter().map(|(row, diff)| {
                let mut row = row.clone();
                for scalar in scalars {
                    let datum = scalar.eval(&row, ctx);
                    row.push(datum);
                }
                (row, *diff)
            })),
            PlanNode::Project { input: i, outputs } => {
                consolidate(input(*i)?.iter().map(|(row, diff)| (project(row, outputs), *diff)))
            }
            PlanNode::ArrangeBy {
                input: i,
                projection,
                ..
            } => consolidate(
                input(*i)?
                    .iter()
                    .map(|(row, diff)| (project(row, projection), *diff)),
            ),
            PlanNode::Union { inputs: union_inputs } => {
                let mut updates = Vec::new();
                for i in union_inputs {
                    updates.extend(input(*i)?.iter().map(|(r, d)| (r.clone(), *d)));
                }
                consolidate(updates)
            }
            PlanNode::Join {
                inputs: join_inputs,
                equivalences,
            } => {
                let mut product: Vec<(Row, Diff)> = vec![(Row::new(), 1)];
                for i in join_inputs {
                    let collection = input(*i)?;
                    let mut next = Vec::with_capacity(product.len() * collection.len());
                    for (prefix, prefix_diff) in product.iter() {
                        for (row, diff) in collection.iter() {
                            let mut joined = prefix.clone();
                            joined.extend(row.iter().cloned());
                            next.push((joined, prefix_diff.saturating_mul(*diff)));
                        }
                    }
                    product = next;
                }
                consolidate(product.into_iter().filter(|(row, _)| {
                    equivalences.iter().all(|class| {
                        let mut values = class.iter().map(|e| e.eval(row, ctx));
                        match values.next() {
                            None => true,
                            Some(first) => !first.is_null() && values.all(|v| v == first),
                        }
                    })
                }))
            }
            PlanNode::Reduce {
                input: i,
                group_key,
                aggregates,
            } => reduce(input(*i)?, group_key, aggregates, ctx),
        };
        results.insert(index, output);
    }
    results.remove(&root).ok_or(EvalError::MissingNode(root))
}

fn project(row: &[Datum], outputs: &[usize]) -> Row {
    outputs
        .iter()
        .map(|c| row.get(*c).cloned().unwrap_or(Datum::Null))
        .collect()
}

fn reduce(
    input: &Collection,
    group_key: &[crate::scalar::ScalarExpr],
    aggregates: &[AggregateExpr],
    ctx: &EvalContext,
) -> Collection {
    let mut groups: BTreeMap<Row, Vec<(&Row, Diff)>> = BTreeMap::new();
    for (row, diff) in input {
        let key = group_key.iter().map(|e| e.eval(row, ctx)).collect();
        groups.entry(key).or_default().push((row, *diff));
    }

    let mut output = Collection::new();
    for (key, rows) in groups {
        let total: Diff = rows.iter().map(|(_, d)| *d).sum();
        if total <= 0 {
            continue;
        }
        let mut result = key;
        for aggregate in aggregates {
            let values = consolidate(
                rows.iter()
                    .map(|(row, diff)| (vec![aggregate.expr.eval(row, ctx)], *diff)),
            );
            let values: Vec<(Datum, Diff)> = values
                .into_iter()
                .filter_map(|(mut row, diff)| {
                    let datum = row.pop().unwrap_or(Datum::Null);
                    (!datum.is_null() && diff > 0).then_some((datum, diff))
                })
                .map(|(datum, diff)| (datum, if aggregate.distinct { 1 } else { diff }))
                .collect();
            result.push(aggregate_values(aggregate.func, &values));
        }
        output.insert(result, 1);
    }
    output
}

fn aggregate_values(func: AggregateFunc, values: &[(Datum, Diff)]) -> Datum {
    match func {
        AggregateFunc::Count => Datum::Int64(values.iter().map(|(_, d)| *d).sum()),
        AggregateFunc::SumInt64 => {
            let mut sum: Option<i64> = None;
            for (datum, diff) in values {
                if let Datum::Int64(i) = datum {
                    let term = match i.checked_mul(*diff) {
                        Some(term) => term,
                        None => return Datum::Null,
                    };
                    sum = match sum.unwrap_or(0).checked_add(term) {
                        Some(s) => Some(s),
                        None => return Datum::Null,
                    };
                }
            }
            sum.map_or(Datum::Null, Datum::Int64)
        }
        AggregateFunc::Min => values
            .iter()
            .map(|(d, _)| d)
            .min()
            .cloned()
            .unwrap_or(Datum::Null),
        AggregateFunc::Max => values
            .iter()
            .map(|(d, _)| d)
            .max()
            .cloned()
            .unwrap_or(Datum::Null),
    }
}
