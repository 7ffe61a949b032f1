// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Compaction frontiers of the arrangements in a merged plan.
//!
//! Each arrangement may discard history up to the meet of the read frontiers
//! of the dataflows that consume it. On a sealed cluster the consumer set is
//! fixed once, at seal time, so there is no future reader to hold history
//! back for and the meet can be applied as soon as it advances.

use std::collections::{BTreeMap, BTreeSet};

use timely::progress::Antichain;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::cse::MergedPlan;
use crate::error::TrackerError;
use crate::frontier::{self, Timestamp};
use crate::id::GlobalId;

/// An instruction to the runtime to allow compaction of the arrangement at
/// `slot` up to `since`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionCommand {
    pub slot: usize,
    pub since: Antichain<Timestamp>,
}

#[derive(Debug)]
struct TrackedArrangement {
    consumers: BTreeSet<GlobalId>,
    since: Antichain<Timestamp>,
    /// Publishes `since` to readers. Only the tracker sends.
    since_tx: watch::Sender<Antichain<Timestamp>>,
}

/// Maintains the compaction frontier of every arrangement in a merged plan.
#[derive(Debug)]
pub struct CompactionFrontierTracker {
    /// The read frontier of every consumer, joined over all of its reports.
    frontiers: BTreeMap<GlobalId, Antichain<Timestamp>>,
    arrangements: BTreeMap<usize, TrackedArrangement>,
    /// The arrangements each dataflow reads.
    reads: BTreeMap<GlobalId, Vec<usize>>,
}

impl CompactionFrontierTracker {
    /// Starts tracking the arrangements of `plan`, given the current read
    /// frontier of each dataflow.
    pub fn new(
        plan: &MergedPlan,
        frontiers: &BTreeMap<GlobalId, Antichain<Timestamp>>,
    ) -> Result<Self, TrackerError> {
        let mut tracked = BTreeMap::new();
        let mut reads: BTreeMap<GlobalId, Vec<usize>> = BTreeMap::new();
        let mut consumer_frontiers = BTreeMap::new();
        for (slot, node) in plan.arrangements() {
            for consumer in &node.consumers {
                let frontier = frontiers
                    .get(consumer)
                    .ok_or(TrackerError::UnknownDataflow(*consumer))?;
                consumer_frontiers.insert(*consumer, frontier.clone());
                reads.entry(*consumer).or_default().push(slot);
            }
            let since = frontier::meet(node.consumers.iter().map(|c| &frontiers[c]));
            let (since_tx, _) = watch::channel(since.clone());
            debug!(
                slot,
                consumers = node.consumers.len(),
                since = %frontier::display(&since),
                "tracking arrangement"
            );
            tracked.insert(
                slot,
                TrackedArrangement {
                    consumers: node.consumers.clone(),
                    since,
                    since_tx,
                },
            );
        }
        // Dataflows without arrangements still report progress.
        for id in plan.roots.keys() {
            if let Some(frontier) = frontiers.get(id) {
                consumer_frontiers
                    .entry(*id)
                    .or_insert_with(|| frontier.clone());
            }
        }
        Ok(CompactionFrontierTracker {
            frontiers: consumer_frontiers,
            arrangements: tracked,
            reads,
        })
    }

    /// The compaction frontier of the arrangement at `slot`.
    pub fn since(&self, slot: usize) -> Option<&Antichain<Timestamp>> {
        self.arrangements.get(&slot).map(|a| &a.since)
    }

    /// The dataflows reading the arrangement at `slot`.
    pub fn consumers(&self, slot: usize) -> Option<&BTreeSet<GlobalId>> {
        self.arrangements.get(&slot).map(|a| &a.consumers)
    }

    /// Returns a receiver that observes the compaction frontier of the
    /// arrangement at `slot`.
    pub fn subscribe(&self, slot: usize) -> Option<watch::Receiver<Antichain<Timestamp>>> {
        self.arrangements.get(&slot).map(|a| a.since_tx.subscribe())
    }

    /// The tracked arrangement slots.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.arrangements.keys().copied()
    }

    /// Commands that bring the runtime up to date with every tracked
    /// frontier, for use right after the merged plan is installed.
    pub fn initial_commands(&self) -> Vec<CompactionCommand> {
        self.arrangements
            .iter()
            .map(|(slot, a)| CompactionCommand {
                slot: *slot,
                since: a.since.clone(),
            })
            .collect()
    }

    /// Applies a progress report from `dataflow`.
    ///
    /// Returns a command for every arrangement whose compaction frontier
    /// advanced as a result.
    ///
    /// # Panics
    ///
    /// Panics if a compaction frontier would move backwards or an arrangement
    /// has lost track of one of its consumers. Both would mean serving reads
    /// from history that was already discarded.
    pub fn report_progress(
        &mut self,
        dataflow: GlobalId,
        reported: &Antichain<Timestamp>,
    ) -> Result<Vec<CompactionCommand>, TrackerError> {
        let current = self
            .frontiers
            .get_mut(&dataflow)
            .ok_or(TrackerError::UnknownDataflow(dataflow))?;
        let joined = frontier::join(current, reported);
        if &joined == current {
            trace!(%dataflow, "progress report does not advance frontier");
            return Ok(Vec::new());
        }
        *current = joined;

        let mut commands = Vec::new();
        let slots = self.reads.get(&dataflow).map(Vec::as_slice).unwrap_or(&[]);
        for slot in slots {
            let arrangement = self
                .arrangements
                .get_mut(slot)
                .expect("consumer reads a tracked arrangement");
            let frontiers = &self.frontiers;
            let since = frontier::meet(arrangement.consumers.iter().map(|c| {
                frontiers.get(c).unwrap_or_else(|| {
                    panic!("arrangement at slot {slot} lost track of consumer {c}")
                })
            }));
            if since == arrangement.since {
                continue;
            }
            if frontier::regresses(&arrangement.since, &since) {
                panic!(
                    "compaction frontier of slot {} regressed from {} to {}",
                    slot,
                    frontier::display(&arrangement.since),
                    frontier::display(&since),
                );
            }
            debug!(
                slot,
                since = %frontier::display(&since),
                "advancing compaction frontier"
            );
            arrangement.since = since.clone();
            arrangement.since_tx.send_replace(since.clone());
            commands.push(CompactionCommand { slot: *slot, since });
        }
        Ok(commands)
    }
}
