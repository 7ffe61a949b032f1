// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Assignment of merged-plan state to memory or secondary storage.
//!
//! Stateful slots that may not spill are resident unconditionally. The
//! remaining budget goes to the spillable slots that maximize total value,
//! where a slot's value is its access frequency weighted by the latency
//! sensitivity of its readers, with the number of consuming dataflows as a
//! tie-breaker. This is a 0/1 knapsack, solved exactly over a bounded number
//! of capacity buckets. Sizes are rounded up to whole buckets and capacity
//! down, so the bucketed solution never exceeds the true budget.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cse::MergedPlan;
use crate::error::OptimizationError;

/// Where a slot's state lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Residency {
    Resident,
    Spilled,
}

/// The residency of every stateful slot of a merged plan.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResidencyPlan {
    pub assignments: BTreeMap<usize, Residency>,
    pub resident_bytes: u64,
    pub spilled_bytes: u64,
    pub budget_bytes: u64,
}

impl ResidencyPlan {
    /// The residency of `slot`. Stateless slots hold nothing to spill and
    /// are reported resident.
    pub fn residency(&self, slot: usize) -> Residency {
        self.assignments
            .get(&slot)
            .copied()
            .unwrap_or(Residency::Resident)
    }

    pub fn spilled_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.assignments
            .iter()
            .filter(|(_, r)| **r == Residency::Spilled)
            .map(|(slot, _)| *slot)
    }
}

/// Decides which slots of a merged plan stay in memory.
#[derive(Clone, Debug)]
pub struct MemoryBudgeter {
    total_bytes: u64,
    buckets: u64,
}

struct Candidate {
    slot: usize,
    size: u64,
    weight: usize,
    value: u128,
}

impl MemoryBudgeter {
    /// A budgeter for `total_bytes` of memory, discretized into at most
    /// `buckets` units of capacity.
    pub fn new(total_bytes: u64, buckets: usize) -> Self {
        MemoryBudgeter {
            total_bytes,
            buckets: u64::try_from(buckets.max(1)).unwrap_or(u64::MAX),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Computes the residency of every stateful slot in `plan`.
    pub fn plan(&self, plan: &MergedPlan) -> Result<ResidencyPlan, OptimizationError> {
        let mut assignments = BTreeMap::new();
        let mut mandatory = 0u64;
        let mut spillable = Vec::new();
        for (slot, node) in plan.nodes.iter().enumerate() {
            if node.hint.size_bytes == 0 {
                continue;
            }
            if node.hint.spillable {
                spillable.push((slot, node));
            } else {
                mandatory = mandatory.saturating_add(node.hint.size_bytes);
                assignments.insert(slot, Residency::Resident);
            }
        }
        if mandatory > self.total_bytes {
            return Err(OptimizationError::BudgetExceeded {
                required: mandatory,
                available: self.total_bytes,
            });
        }

        let remaining = self.total_bytes - mandatory;
        let bucket_bytes = remaining.div_ceil(self.buckets).max(1);
        let capacity = to_index(remaining / bucket_bytes)?;
        let candidates = spillable
            .into_iter()
            .map(|(slot, node)| {
                let priority = node
                    .hint
                    .access_frequency
                    .saturating_mul(node.hint.latency.sensitivity())
                    .saturating_add(1);
                let consumers = u32::try_from(node.consumers.len()).unwrap_or(u32::MAX);
                Ok(Candidate {
                    slot,
                    size: node.hint.size_bytes,
                    weight: to_index(node.hint.size_bytes.div_ceil(bucket_bytes))?,
                    value: (u128::from(priority) << 32) | u128::from(consumers),
                })
            })
            .collect::<Result<Vec<_>, OptimizationError>>()?;

        let chosen = knapsack(&candidates, capacity);
        let mut resident_bytes = mandatory;
        let mut spilled_bytes = 0u64;
        for (candidate, resident) in candidates.iter().zip(chosen) {
            let residency = if resident {
                resident_bytes = resident_bytes.saturating_add(candidate.size);
                Residency::Resident
            } else {
                spilled_bytes = spilled_bytes.saturating_add(candidate.size);
                Residency::Spilled
            };
            debug!(slot = candidate.slot, size = candidate.size, ?residency, "assigned residency");
            assignments.insert(candidate.slot, residency);
        }
        assert!(
            resident_bytes <= self.total_bytes,
            "resident state of {} bytes exceeds budget of {} bytes",
            resident_bytes,
            self.total_bytes
        );
        info!(
            resident_bytes,
            spilled_bytes,
            budget_bytes = self.total_bytes,
            "computed residency plan"
        );
        Ok(ResidencyPlan {
            assignments,
            resident_bytes,
            spilled_bytes,
            budget_bytes: self.total_bytes,
        })
    }
}

fn to_index(units: u64) -> Result<usize, OptimizationError> {
    usize::try_from(units)
        .map_err(|_| OptimizationError::Internal(format!("capacity of {units} buckets overflows")))
}

/// Solves the 0/1 knapsack over `candidates`, returning for each whether it
/// is taken.
fn knapsack(candidates: &[Candidate], capacity: usize) -> Vec<bool> {
    let mut best = vec![0u128; capacity + 1];
    let mut taken = vec![vec![false; capacity + 1]; candidates.len()];
    for (i, candidate) in candidates.iter().enumerate() {
        if candidate.weight > capacity {
            continue;
        }
        for c in (candidate.weight..=capacity).rev() {
            let with = best[c - candidate.weight].saturating_add(candidate.value);
            if with > best[c] {
                best[c] = with;
                taken[i][c] = true;
            }
        }
    }

    let mut chosen = vec![false; candidates.len()];
    let mut c = capacity;
    for i in (0..candidates.len()).rev() {
        if taken[i][c] {
            chosen[i] = true;
            c -= candidates[i].weight;
        }
    }
    chosen
}
