// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The set of dataflows installed on a cluster.
//!
//! The registry is the only place dataflows are added to or removed from a
//! cluster, and it owns the cluster's [`ClusterSealState`]. Mutations are
//! refused unless the cluster is unsealed; this check is what makes a sealed
//! cluster's dataflow set immutable.
//!
//! The set itself is versioned and copy-on-write. A [`RegistrySnapshot`] is a
//! cheap handle to one version; the seal coordinator optimizes against a
//! snapshot while the registry keeps serving reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use timely::progress::Antichain;
use tracing::{debug, info};

use crate::error::Rejected;
use crate::frontier::{self, Timestamp};
use crate::id::{ClusterId, GlobalId};
use crate::plan::PhysicalPlan;
use crate::state::{ClusterSealState, SealState};

/// A dataflow installed on a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataflow {
    pub id: GlobalId,
    pub debug_name: String,
    pub plan: PhysicalPlan,
    /// The earliest time at which the dataflow must still be able to answer
    /// queries and subscriptions.
    pub read_frontier: Antichain<Timestamp>,
}

impl Dataflow {
    pub fn new(
        id: GlobalId,
        debug_name: impl Into<String>,
        plan: PhysicalPlan,
        read_frontier: Antichain<Timestamp>,
    ) -> Self {
        Dataflow {
            id,
            debug_name: debug_name.into(),
            plan,
            read_frontier,
        }
    }
}

/// An immutable view of one version of a registry.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    version: u64,
    dataflows: Arc<BTreeMap<GlobalId, Arc<Dataflow>>>,
    frontiers: Arc<BTreeMap<GlobalId, Antichain<Timestamp>>>,
}

impl RegistrySnapshot {
    /// The registry version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The dataflows, in `GlobalId` order.
    pub fn list(&self) -> Vec<Arc<Dataflow>> {
        self.dataflows.values().cloned().collect()
    }

    pub fn get(&self, id: &GlobalId) -> Option<&Arc<Dataflow>> {
        self.dataflows.get(id)
    }

    pub fn len(&self) -> usize {
        self.dataflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataflows.is_empty()
    }

    /// The current read frontier of each dataflow: its declared frontier,
    /// advanced by any progress it reported since.
    pub fn frontiers(&self) -> &BTreeMap<GlobalId, Antichain<Timestamp>> {
        &self.frontiers
    }
}

/// The authoritative set of dataflows installed on a cluster.
#[derive(Debug)]
pub struct DataflowRegistry {
    cluster_id: ClusterId,
    seal_state: ClusterSealState,
    version: u64,
    dataflows: Arc<BTreeMap<GlobalId, Arc<Dataflow>>>,
    frontiers: Arc<BTreeMap<GlobalId, Antichain<Timestamp>>>,
}

impl DataflowRegistry {
    /// Creates an empty, unsealed registry.
    pub fn new(cluster_id: ClusterId) -> Self {
        Self::restored(cluster_id, ClusterSealState::default(), Vec::new())
    }

    /// Creates a registry holding `dataflows` in `seal_state`.
    pub fn restored(
        cluster_id: ClusterId,
        seal_state: ClusterSealState,
        dataflows: Vec<Dataflow>,
    ) -> Self {
        let frontiers = dataflows
            .iter()
            .map(|df| (df.id, df.read_frontier.clone()))
            .collect();
        let dataflows = dataflows
            .into_iter()
            .map(|df| (df.id, Arc::new(df)))
            .collect();
        DataflowRegistry {
            cluster_id,
            seal_state,
            version: 0,
            dataflows: Arc::new(dataflows),
            frontiers: Arc::new(frontiers),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// The current seal state of the cluster.
    pub fn seal_state(&self) -> SealState {
        self.seal_state.get()
    }

    /// The seal state machine. Only the seal coordinator drives it.
    pub(crate) fn seal_state_mut(&mut self) -> &mut ClusterSealState {
        &mut self.seal_state
    }

    /// The current version. Every successful mutation increments it.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The installed dataflows, in `GlobalId` order.
    ///
    /// The order is stable so that optimizing equal dataflow sets produces
    /// equal plans.
    pub fn list(&self) -> Vec<Arc<Dataflow>> {
        self.dataflows.values().cloned().collect()
    }

    pub fn get(&self, id: &GlobalId) -> Option<&Arc<Dataflow>> {
        self.dataflows.get(id)
    }

    pub fn len(&self) -> usize {
        self.dataflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataflows.is_empty()
    }

    /// A consistent view of the current version.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            version: self.version,
            dataflows: Arc::clone(&self.dataflows),
            frontiers: Arc::clone(&self.frontiers),
        }
    }

    /// Installs a dataflow.
    pub fn install(&mut self, dataflow: Dataflow) -> Result<(), Rejected> {
        self.check_mutable()?;
        if self.dataflows.contains_key(&dataflow.id) {
            return Err(Rejected::DataflowExists(dataflow.id));
        }
        dataflow
            .plan
            .validate()
            .map_err(|error| Rejected::InvalidPlan {
                id: dataflow.id,
                error,
            })?;

        info!(
            cluster_id = %self.cluster_id,
            dataflow_id = %dataflow.id,
            name = %dataflow.debug_name,
            "installing dataflow"
        );
        Arc::make_mut(&mut self.frontiers).insert(dataflow.id, dataflow.read_frontier.clone());
        Arc::make_mut(&mut self.dataflows).insert(dataflow.id, Arc::new(dataflow));
        self.version += 1;
        Ok(())
    }

    /// Removes a dataflow, returning its definition.
    pub fn remove(&mut self, id: &GlobalId) -> Result<Arc<Dataflow>, Rejected> {
        self.check_mutable()?;
        let removed = Arc::make_mut(&mut self.dataflows)
            .remove(id)
            .ok_or(Rejected::DataflowMissing(*id))?;
        Arc::make_mut(&mut self.frontiers).remove(id);
        info!(cluster_id = %self.cluster_id, dataflow_id = %id, "removed dataflow");
        self.version += 1;
        Ok(removed)
    }

    /// Puts back a dataflow taken out by [`DataflowRegistry::remove`], at the
    /// frontier it had reached rather than the one it was declared with.
    pub fn reinstate(
        &mut self,
        dataflow: Arc<Dataflow>,
        frontier: Antichain<Timestamp>,
    ) -> Result<(), Rejected> {
        self.check_mutable()?;
        if self.dataflows.contains_key(&dataflow.id) {
            return Err(Rejected::DataflowExists(dataflow.id));
        }
        info!(
            cluster_id = %self.cluster_id,
            dataflow_id = %dataflow.id,
            frontier = %frontier::display(&frontier),
            "reinstating dataflow"
        );
        Arc::make_mut(&mut self.frontiers).insert(dataflow.id, frontier);
        Arc::make_mut(&mut self.dataflows).insert(dataflow.id, dataflow);
        self.version += 1;
        Ok(())
    }

    /// Records that dataflow `id` no longer needs times before `frontier`.
    ///
    /// Reports are joined with what is already known, so a report that
    /// arrives out of order cannot move the dataflow's frontier backwards.
    /// Returns the dataflow's resulting frontier, or `None` if the dataflow is
    /// not installed. Progress does not change the registry version.
    pub fn record_progress(
        &mut self,
        id: &GlobalId,
        frontier: &Antichain<Timestamp>,
    ) -> Option<Antichain<Timestamp>> {
        let frontiers = Arc::make_mut(&mut self.frontiers);
        let current = frontiers.get_mut(id)?;
        if frontier::regresses(current, frontier) {
            debug!(
                dataflow_id = %id,
                current = %frontier::display(current),
                reported = %frontier::display(frontier),
                "ignoring stale progress report"
            );
        }
        *current = frontier::join(current, frontier);
        Some(current.clone())
    }

    /// The current read frontier of dataflow `id`.
    pub fn frontier(&self, id: &GlobalId) -> Option<&Antichain<Timestamp>> {
        self.frontiers.get(id)
    }

    fn check_mutable(&self) -> Result<(), Rejected> {
        if self.seal_state.get().allows_mutation() {
            Ok(())
        } else {
            debug!(
                cluster_id = %self.cluster_id,
                state = %self.seal_state.get(),
                "refusing dataflow mutation"
            );
            Err(Rejected::ClusterSealed(self.cluster_id))
        }
    }
}
