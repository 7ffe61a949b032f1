// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The boundary between sealed-cluster management and the compute runtime
//! that executes dataflows.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::budget::ResidencyPlan;
use crate::compaction::CompactionCommand;
use crate::cse::MergedPlan;
use crate::id::{ClusterId, GlobalId};
use crate::registry::{Dataflow, RegistrySnapshot};

/// The plan a cluster executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunningPlan {
    /// Every dataflow runs its own plan; nothing is shared.
    Independent {
        dataflows: BTreeMap<GlobalId, Arc<Dataflow>>,
    },
    /// The dataflows of a sealed cluster run as one merged plan.
    Merged {
        plan: MergedPlan,
        residency: ResidencyPlan,
    },
}

impl RunningPlan {
    /// The independent plan of the dataflows in `snapshot`.
    pub fn independent(snapshot: &RegistrySnapshot) -> Self {
        RunningPlan::Independent {
            dataflows: snapshot.list().into_iter().map(|df| (df.id, df)).collect(),
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, RunningPlan::Merged { .. })
    }

    pub fn merged(&self) -> Option<&MergedPlan> {
        match self {
            RunningPlan::Merged { plan, .. } => Some(plan),
            RunningPlan::Independent { .. } => None,
        }
    }

    pub fn residency(&self) -> Option<&ResidencyPlan> {
        match self {
            RunningPlan::Merged { residency, .. } => Some(residency),
            RunningPlan::Independent { .. } => None,
        }
    }

    /// The dataflows the plan computes.
    pub fn dataflows(&self) -> Vec<GlobalId> {
        match self {
            RunningPlan::Independent { dataflows } => dataflows.keys().copied().collect(),
            RunningPlan::Merged { plan, .. } => plan.roots.keys().copied().collect(),
        }
    }

    /// The state the plan keeps in memory.
    pub fn resident_bytes(&self) -> u64 {
        match self {
            RunningPlan::Independent { dataflows } => dataflows
                .values()
                .map(|df| df.plan.total_size_bytes())
                .fold(0, u64::saturating_add),
            RunningPlan::Merged { residency, .. } => residency.resident_bytes,
        }
    }
}

/// A compute runtime executing the dataflows of clusters.
///
/// Implementations must apply each call atomically: a failed call leaves the
/// runtime as it was.
#[async_trait]
pub trait ComputeRuntime: Debug + Send + Sync {
    /// Starts executing `dataflow` on an unsealed cluster.
    async fn install_dataflow(
        &self,
        cluster_id: ClusterId,
        dataflow: &Dataflow,
    ) -> Result<(), anyhow::Error>;

    /// Stops executing dataflow `id` on an unsealed cluster.
    async fn remove_dataflow(&self, cluster_id: ClusterId, id: GlobalId)
        -> Result<(), anyhow::Error>;

    /// Replaces everything the cluster executes with `plan`.
    async fn publish_plan(
        &self,
        cluster_id: ClusterId,
        plan: &RunningPlan,
    ) -> Result<(), anyhow::Error>;

    /// Permits the runtime to discard arrangement history.
    async fn allow_compaction(
        &self,
        cluster_id: ClusterId,
        commands: Vec<CompactionCommand>,
    ) -> Result<(), anyhow::Error>;
}

/// A call received by a [`RecordingRuntime`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeEvent {
    Install(ClusterId, GlobalId),
    Remove(ClusterId, GlobalId),
    /// The dataflows of the published plan, and whether it is merged.
    Publish {
        cluster_id: ClusterId,
        dataflows: Vec<GlobalId>,
        merged: bool,
    },
    Compaction(ClusterId, Vec<CompactionCommand>),
}

/// An in-memory [`ComputeRuntime`] that records the calls it receives.
///
/// Publication can be paused, to observe a cluster mid-seal, and individual
/// calls can be made to fail.
#[derive(Debug)]
pub struct RecordingRuntime {
    events: Mutex<Vec<RuntimeEvent>>,
    plans: Mutex<BTreeMap<ClusterId, RunningPlan>>,
    fail_next_publish: AtomicBool,
    fail_next_install: AtomicBool,
    fail_next_remove: AtomicBool,
    paused: watch::Sender<bool>,
    publish_started: Notify,
}

impl Default for RecordingRuntime {
    fn default() -> Self {
        RecordingRuntime {
            events: Mutex::new(Vec::new()),
            plans: Mutex::new(BTreeMap::new()),
            fail_next_publish: AtomicBool::new(false),
            fail_next_install: AtomicBool::new(false),
            fail_next_remove: AtomicBool::new(false),
            paused: watch::Sender::new(false),
            publish_started: Notify::new(),
        }
    }
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The calls received so far.
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// The plan most recently published for `cluster_id`.
    pub fn published(&self, cluster_id: ClusterId) -> Option<RunningPlan> {
        self.plans
            .lock()
            .expect("lock poisoned")
            .get(&cluster_id)
            .cloned()
    }

    pub fn fail_next_publish(&self) {
        self.fail_next_publish.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_install(&self) {
        self.fail_next_install.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_remove(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }

    /// Makes `publish_plan` wait until [`RecordingRuntime::resume_publish`].
    pub fn pause_publish(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_publish(&self) {
        self.paused.send_replace(false);
    }

    /// Waits until a `publish_plan` call has begun.
    pub async fn publish_started(&self) {
        self.publish_started.notified().await;
    }

    fn record(&self, event: RuntimeEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

#[async_trait]
impl ComputeRuntime for RecordingRuntime {
    async fn install_dataflow(
        &self,
        cluster_id: ClusterId,
        dataflow: &Dataflow,
    ) -> Result<(), anyhow::Error> {
        if self.fail_next_install.swap(false, Ordering::SeqCst) {
            bail!("replica rejected dataflow {}", dataflow.id);
        }
        self.record(RuntimeEvent::Install(cluster_id, dataflow.id));
        Ok(())
    }

    async fn remove_dataflow(
        &self,
        cluster_id: ClusterId,
        id: GlobalId,
    ) -> Result<(), anyhow::Error> {
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            bail!("replica lost track of dataflow {id}");
        }
        self.record(RuntimeEvent::Remove(cluster_id, id));
        Ok(())
    }

    async fn publish_plan(
        &self,
        cluster_id: ClusterId,
        plan: &RunningPlan,
    ) -> Result<(), anyhow::Error> {
        self.publish_started.notify_one();
        let mut paused = self.paused.subscribe();
        // The sender lives as long as `self`.
        let _ = paused.wait_for(|paused| !*paused).await;
        if self.fail_next_publish.swap(false, Ordering::SeqCst) {
            bail!("replica disconnected while installing plan");
        }
        self.record(RuntimeEvent::Publish {
            cluster_id,
            dataflows: plan.dataflows(),
            merged: plan.is_merged(),
        });
        self.plans
            .lock()
            .expect("lock poisoned")
            .insert(cluster_id, plan.clone());
        Ok(())
    }

    async fn allow_compaction(
        &self,
        cluster_id: ClusterId,
        commands: Vec<CompactionCommand>,
    ) -> Result<(), anyhow::Error> {
        self.record(RuntimeEvent::Compaction(cluster_id, commands));
        Ok(())
    }
}
