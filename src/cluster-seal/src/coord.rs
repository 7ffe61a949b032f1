// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sealing and unsealing of clusters.
//!
//! A [`Cluster`] owns the dataflow registry of one cluster and the plan it
//! currently runs. Sealing proceeds in two halves:
//!
//! 1. Under the DDL lock, the cluster moves to `Sealing` and takes a snapshot
//!    of its registry. From here on, dataflow creation and drops are refused,
//!    so the snapshot is the final dataflow set.
//! 2. Without holding any lock, the [`SealCoordinator`] optimizes the
//!    snapshot on a blocking thread, bounded by the configured deadline. The
//!    result is installed in the runtime, committed to the catalog, and
//!    finally published locally, and the cluster moves to `Sealed`.
//!
//! If any step of the second half fails, or the caller stops waiting for it,
//! the cluster returns to `Unsealed` and keeps running the plan it ran
//! before. Reads and progress reports are served throughout.
//!
//! Dataflow creation, drops, and unsealing change the registry, the runtime,
//! and the catalog together. Once started they run to completion on their
//! own task, so a cancelled caller cannot leave those out of step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use timely::progress::Antichain;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::budget::{MemoryBudgeter, ResidencyPlan};
use crate::catalog::{DurableClusterRecord, DurablePlan, SealCatalog};
use crate::compaction::{CompactionCommand, CompactionFrontierTracker};
use crate::config::SealConfig;
use crate::cse::{CrossDataflowOptimizer, MergeStats, MergedPlan};
use crate::error::{CatalogError, OptimizationError, Rejected, SealError, TrackerError};
use crate::frontier::Timestamp;
use crate::id::{ClusterId, GlobalId};
use crate::metrics::SealMetrics;
use crate::plan::PhysicalPlan;
use crate::registry::{Dataflow, DataflowRegistry, RegistrySnapshot};
use crate::runtime::{ComputeRuntime, RunningPlan};
use crate::sharing::SharingPlan;
use crate::state::{ClusterConfig, ClusterSealState, SealState};

/// The result of re-optimizing a cluster's dataflows.
#[derive(Debug)]
pub struct Optimized {
    pub plan: MergedPlan,
    pub residency: ResidencyPlan,
    pub tracker: CompactionFrontierTracker,
    pub stats: MergeStats,
    /// Arrangements the sharing analysis aligned across dataflows.
    pub sharing_groups: usize,
}

/// Builds the merged plan of a frozen dataflow set.
#[derive(Clone, Debug)]
pub struct SealCoordinator {
    config: SealConfig,
}

impl SealCoordinator {
    pub fn new(config: SealConfig) -> Self {
        SealCoordinator { config }
    }

    /// Re-optimizes the dataflows in `snapshot` as a whole.
    ///
    /// Equal arrangements are aligned, common operators are merged, every
    /// arrangement's compaction frontier is derived from its consumers, and
    /// the resulting state is fit into the memory budget. The merged plan is
    /// validated before it is returned.
    pub fn optimize(&self, snapshot: &RegistrySnapshot) -> Result<Optimized, OptimizationError> {
        let dataflows = snapshot.list();

        let (plans, sharing_groups): (Vec<(GlobalId, PhysicalPlan)>, usize) =
            if self.config.enable_arrangement_sharing {
                let sharing = SharingPlan::analyze(&dataflows);
                (sharing.rewrite(&dataflows), sharing.len())
            } else {
                let plans = dataflows
                    .iter()
                    .map(|df| (df.id, df.plan.clone()))
                    .collect();
                (plans, 0)
            };

        let (plan, stats) = CrossDataflowOptimizer::merge(
            plans.iter().map(|(id, plan)| (*id, plan)),
            self.config.enable_cse,
        );
        plan.validate()?;
        if let Some(missing) = dataflows.iter().find(|df| !plan.roots.contains_key(&df.id)) {
            return Err(OptimizationError::MissingRoot(missing.id));
        }

        let tracker = CompactionFrontierTracker::new(&plan, snapshot.frontiers())
            .map_err(|e| OptimizationError::Internal(e.to_string()))?;
        let residency =
            MemoryBudgeter::new(self.config.memory_budget_bytes, self.config.knapsack_buckets)
                .plan(&plan)?;

        Ok(Optimized {
            plan,
            residency,
            tracker,
            stats,
            sharing_groups,
        })
    }
}


/// State guarded by the cluster's lock. The lock is never held across an
/// await point.
#[derive(Debug)]
struct ClusterInner {
    registry: DataflowRegistry,
    config: ClusterConfig,
    /// Present exactly while the cluster is sealed.
    tracker: Option<CompactionFrontierTracker>,
}

/// A cluster whose dataflows can be sealed into a single merged plan.
#[derive(Debug)]
pub struct Cluster {
    id: ClusterId,
    name: String,
    inner: Arc<Mutex<ClusterInner>>,
    /// Serializes dataflow creation, drops, and the start of seal and unseal.
    ddl: Arc<tokio::sync::Mutex<()>>,
    plan_tx: Arc<watch::Sender<Arc<RunningPlan>>>,
    coordinator: SealCoordinator,
    config: SealConfig,
    runtime: Arc<dyn ComputeRuntime>,
    catalog: Arc<dyn SealCatalog>,
    metrics: SealMetrics,
}

/// A durable plan that can be resumed as is.
#[derive(Debug)]
struct Resumable {
    plan: MergedPlan,
    residency: ResidencyPlan,
    tracker: CompactionFrontierTracker,
}

impl Cluster {
    /// Creates a new, empty, unsealed cluster and records it durably.
    pub async fn create(
        id: ClusterId,
        name: impl Into<String>,
        cluster_config: ClusterConfig,
        config: SealConfig,
        runtime: Arc<dyn ComputeRuntime>,
        catalog: Arc<dyn SealCatalog>,
        metrics: SealMetrics,
    ) -> Result<Self, SealError> {
        let name = name.into();
        let mut cluster_config = cluster_config;
        cluster_config.sealed = false;
        let record = DurableClusterRecord {
            name: name.clone(),
            config: cluster_config.clone(),
            plan: None,
        };
        catalog.commit_cluster(id, &record).await?;
        info!(cluster_id = %id, %name, "created cluster");
        let registry = DataflowRegistry::new(id);
        Ok(Self::assemble(
            id,
            name,
            registry,
            cluster_config,
            None,
            RunningPlan::Independent {
                dataflows: Default::default(),
            },
            config,
            runtime,
            catalog,
            metrics,
        ))
    }

    /// Restores a cluster from its durable record after a restart.
    ///
    /// `dataflows` are the cluster's dataflows as recorded in the catalog. A
    /// sealed cluster resumes the merged plan it was sealed with. If that plan
    /// does not cover exactly `dataflows` or no longer fits the memory
    /// budget, the cluster is re-sealed from scratch. A cluster that fails to
    /// re-seal opens unsealed and is recorded as such.
    pub async fn open(
        id: ClusterId,
        dataflows: Vec<Dataflow>,
        config: SealConfig,
        runtime: Arc<dyn ComputeRuntime>,
        catalog: Arc<dyn SealCatalog>,
        metrics: SealMetrics,
    ) -> Result<Self, SealError> {
        let mut record = catalog.load_cluster(id).await?;

        let resumable = match record.plan.take() {
            Some(durable) if record.config.sealed => {
                Self::resumable(id, durable, &dataflows, &config)
            }
            _ => None,
        };

        if let Some(Resumable {
            plan,
            residency,
            tracker,
        }) = resumable
        {
            let registry =
                DataflowRegistry::restored(id, ClusterSealState::restored(true), dataflows);
            let initial = tracker.initial_commands();
            let running = RunningPlan::Merged { plan, residency };
            runtime
                .publish_plan(id, &running)
                .await
                .map_err(|e| SealError::SwapAborted(format!("{e:#}")))?;
            if let Err(e) = runtime.allow_compaction(id, initial).await {
                warn!(cluster_id = %id, "failed to apply compaction frontiers: {e:#}");
            }
            info!(cluster_id = %id, name = %record.name, "restored sealed cluster");
            return Ok(Self::assemble(
                id,
                record.name,
                registry,
                record.config,
                Some(tracker),
                running,
                config,
                runtime,
                catalog,
                metrics,
            ));
        }

        let reseal = record.config.sealed;
        let mut cluster_config = record.config;
        cluster_config.sealed = false;
        let registry = DataflowRegistry::restored(id, ClusterSealState::default(), dataflows);
        let running = RunningPlan::independent(&registry.snapshot());
        runtime
            .publish_plan(id, &running)
            .await
            .map_err(|e| SealError::SwapAborted(format!("{e:#}")))?;
        let cluster = Self::assemble(
            id,
            record.name,
            registry,
            cluster_config,
            None,
            running,
            config,
            runtime,
            catalog,
            metrics,
        );
        info!(cluster_id = %id, name = %cluster.name, "restored unsealed cluster");
        if reseal {
            if let Err(e) = cluster.seal().await {
                warn!(cluster_id = %id, "failed to re-seal cluster, opening it unsealed: {e}");
                if let Err(e) = cluster.detached().persist_unsealed().await {
                    error!(cluster_id = %id, "failed to persist unsealed state: {e}");
                }
            }
        }
        Ok(cluster)
    }

    /// Checks that a durable plan covers exactly `dataflows`, is well formed,
    /// and fits the memory budget.
    fn resumable(
        id: ClusterId,
        durable: DurablePlan,
        dataflows: &[Dataflow],
        config: &SealConfig,
    ) -> Option<Resumable> {
        let ids: BTreeSet<GlobalId> = dataflows.iter().map(|df| df.id).collect();
        let roots: BTreeSet<GlobalId> = durable.roots.iter().map(|(id, _)| *id).collect();
        if roots != ids {
            warn!(
                cluster_id = %id,
                "durable plan does not match the cluster's dataflows; re-sealing"
            );
            return None;
        }
        if durable.residency.resident_bytes > config.memory_budget_bytes {
            warn!(
                cluster_id = %id,
                resident_bytes = durable.residency.resident_bytes,
                budget_bytes = config.memory_budget_bytes,
                "durable plan exceeds the memory budget; re-sealing"
            );
            return None;
        }
        let (plan, residency) = durable.into_parts();
        if let Err(e) = plan.validate() {
            warn!(cluster_id = %id, "durable plan is invalid; re-sealing: {e}");
            return None;
        }
        let frontiers: BTreeMap<GlobalId, Antichain<Timestamp>> = dataflows
            .iter()
            .map(|df| (df.id, df.read_frontier.clone()))
            .collect();
        match CompactionFrontierTracker::new(&plan, &frontiers) {
            Ok(tracker) => Some(Resumable {
                plan,
                residency,
                tracker,
            }),
            Err(e) => {
                warn!(cluster_id = %id, "durable plan reads unknown dataflows; re-sealing: {e}");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: ClusterId,
        name: String,
        registry: DataflowRegistry,
        cluster_config: ClusterConfig,
        tracker: Option<CompactionFrontierTracker>,
        running: RunningPlan,
        config: SealConfig,
        runtime: Arc<dyn ComputeRuntime>,
        catalog: Arc<dyn SealCatalog>,
        metrics: SealMetrics,
    ) -> Self {
        let (plan_tx, _) = watch::channel(Arc::new(running));
        Cluster {
            id,
            name,
            inner: Arc::new(Mutex::new(ClusterInner {
                registry,
                config: cluster_config,
                tracker,
            })),
            ddl: Arc::new(tokio::sync::Mutex::new(())),
            plan_tx: Arc::new(plan_tx),
            coordinator: SealCoordinator::new(config.clone()),
            config,
            runtime,
            catalog,
            metrics,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seal_state(&self) -> SealState {
        self.inner().registry.seal_state()
    }

    /// The cluster's configuration as last committed.
    pub fn cluster_config(&self) -> ClusterConfig {
        self.inner().config.clone()
    }

    /// The installed dataflows, in `GlobalId` order.
    pub fn dataflows(&self) -> Vec<Arc<Dataflow>> {
        self.inner().registry.list()
    }

    /// The version of the cluster's dataflow set.
    pub fn registry_version(&self) -> u64 {
        self.inner().registry.version()
    }

    /// The plan the cluster currently runs.
    pub fn running_plan(&self) -> Arc<RunningPlan> {
        Arc::clone(&self.plan_tx.borrow())
    }

    /// Returns a receiver that observes every plan the cluster publishes.
    pub fn subscribe_plan(&self) -> watch::Receiver<Arc<RunningPlan>> {
        self.plan_tx.subscribe()
    }

    /// Returns a receiver that observes the compaction frontier of the
    /// arrangement at `slot` of the merged plan. `None` unless sealed.
    pub fn subscribe_compaction(&self, slot: usize) -> Option<watch::Receiver<Antichain<Timestamp>>> {
        self.inner().tracker.as_ref()?.subscribe(slot)
    }

    /// The compaction frontier of the arrangement at `slot`. `None` unless
    /// sealed.
    pub fn compaction_frontier(&self, slot: usize) -> Option<Antichain<Timestamp>> {
        self.inner().tracker.as_ref()?.since(slot).cloned()
    }

    /// Creates a dataflow on the cluster.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster_id = %self.id, dataflow_id = %dataflow.id))]
    pub async fn install_dataflow(&self, dataflow: Dataflow) -> Result<(), Rejected> {
        let ddl = Arc::clone(&self.ddl).lock_owned().await;
        let id = dataflow.id;
        let definition = dataflow.clone();
        self.inner()
            .registry
            .install(dataflow)
            .map_err(|e| self.note_rejection(e))?;

        let cluster = self.detached();
        let task = tokio::spawn(
            async move {
                let _ddl = ddl;
                if let Err(e) = cluster.runtime.install_dataflow(cluster.id, &definition).await {
                    if let Err(undo) = cluster.inner().registry.remove(&id) {
                        error!(%id, "failed to undo dataflow installation: {undo}");
                    }
                    return Err(Rejected::Runtime {
                        id,
                        reason: format!("{e:#}"),
                    });
                }
                cluster.publish_independent();
                Ok(())
            }
            .in_current_span(),
        );
        task.await.map_err(|e| Rejected::Runtime {
            id,
            reason: e.to_string(),
        })?
    }

    /// Drops a dataflow from the cluster.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster_id = %self.id))]
    pub async fn remove_dataflow(&self, id: GlobalId) -> Result<(), Rejected> {
        let ddl = Arc::clone(&self.ddl).lock_owned().await;
        let (removed, frontier) = {
            let mut inner = self.inner();
            let frontier = inner.registry.frontier(&id).cloned();
            let removed = inner
                .registry
                .remove(&id)
                .map_err(|e| self.note_rejection(e))?;
            let frontier = frontier.unwrap_or_else(|| removed.read_frontier.clone());
            (removed, frontier)
        };

        let cluster = self.detached();
        let task = tokio::spawn(
            async move {
                let _ddl = ddl;
                if let Err(e) = cluster.runtime.remove_dataflow(cluster.id, id).await {
                    if let Err(undo) = cluster.inner().registry.reinstate(removed, frontier) {
                        error!(%id, "failed to undo dataflow removal: {undo}");
                    }
                    return Err(Rejected::Runtime {
                        id,
                        reason: format!("{e:#}"),
                    });
                }
                cluster.publish_independent();
                Ok(())
            }
            .in_current_span(),
        );
        task.await.map_err(|e| Rejected::Runtime {
            id,
            reason: e.to_string(),
        })?
    }

    /// Applies a progress report from dataflow `id`.
    ///
    /// While unsealed the report is only recorded, so that a later seal
    /// starts from current frontiers. While sealed, it also advances the
    /// compaction frontiers of the arrangements the dataflow reads, and the
    /// runtime is told about every advance.
    pub async fn report_progress(
        &self,
        id: GlobalId,
        frontier: Antichain<Timestamp>,
    ) -> Result<(), TrackerError> {
        let commands = {
            let mut inner = self.inner();
            if inner.registry.record_progress(&id, &frontier).is_none() {
                return Err(TrackerError::UnknownDataflow(id));
            }
            match inner.tracker.as_mut() {
                Some(tracker) => tracker.report_progress(id, &frontier)?,
                None => Vec::new(),
            }
        };
        self.allow_compaction(commands).await;
        Ok(())
    }

    /// Seals the cluster.
    ///
    /// Freezes the dataflow set, replaces the independent per-dataflow plans
    /// with one merged plan, and persists the sealed state. Sealing a sealed
    /// cluster does nothing. On failure, or if the returned future is dropped
    /// before it completes, the cluster is unsealed again and runs the plan
    /// it ran before.
    #[tracing::instrument(level = "info", skip(self), fields(cluster_id = %self.id))]
    pub async fn seal(&self) -> Result<(), SealError> {
        let snapshot = {
            let _ddl = self.ddl.lock().await;
            let mut inner = self.inner();
            match inner.registry.seal_state() {
                SealState::Sealed => {
                    debug!("cluster already sealed");
                    return Ok(());
                }
                SealState::Sealing => return Err(SealError::SealInProgress(self.id)),
                SealState::Unsealed => {}
            }
            inner.registry.seal_state_mut().begin_seal()?;
            inner.registry.snapshot()
        };
        info!(
            dataflows = snapshot.len(),
            version = snapshot.version(),
            "sealing cluster"
        );

        let mut attempt = SealAttempt {
            cluster: self.detached(),
            metrics: self.metrics.clone(),
            previous: self.running_plan(),
            stage: SwapStage::Local,
            completed: false,
        };
        match self.reoptimize_and_swap(snapshot, &mut attempt).await {
            Ok(()) => {
                self.metrics.seals.with_label_values(&["succeeded"]).inc();
                info!("sealed cluster");
                Ok(())
            }
            Err(e) => {
                warn!("seal failed, cluster remains unsealed: {e}");
                attempt.revert().await;
                Err(e)
            }
        }
    }

    async fn reoptimize_and_swap(
        &self,
        snapshot: RegistrySnapshot,
        attempt: &mut SealAttempt,
    ) -> Result<(), SealError> {
        let deadline = self.config.optimizer_deadline;
        if deadline.is_zero() {
            return Err(OptimizationError::DeadlineExceeded(deadline).into());
        }
        let coordinator = self.coordinator.clone();
        let start = Instant::now();
        let task = tokio::task::spawn_blocking(move || coordinator.optimize(&snapshot));
        let optimized = match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(OptimizationError::Internal(join_error.to_string()).into())
            }
            Err(_) => return Err(OptimizationError::DeadlineExceeded(deadline).into()),
        };
        self.metrics
            .optimization_seconds
            .observe(start.elapsed().as_secs_f64());
        if optimized.residency.resident_bytes > self.config.memory_budget_bytes {
            return Err(OptimizationError::BudgetExceeded {
                required: optimized.residency.resident_bytes,
                available: self.config.memory_budget_bytes,
            }
            .into());
        }
        info!(
            sharing_groups = optimized.sharing_groups,
            merged_nodes = optimized.stats.merged_nodes,
            shared_nodes = optimized.stats.shared_nodes,
            resident_bytes = optimized.residency.resident_bytes,
            spilled_bytes = optimized.residency.spilled_bytes,
            "re-optimized cluster"
        );

        let Optimized {
            plan,
            residency,
            mut tracker,
            ..
        } = optimized;
        let durable = DurablePlan::new(&plan, &residency);
        let running = Arc::new(RunningPlan::Merged { plan, residency });

        attempt.stage = SwapStage::Published;
        if let Err(e) = self.runtime.publish_plan(self.id, &running).await {
            // A refused plan leaves the previous one running.
            attempt.stage = SwapStage::Local;
            return Err(SealError::SwapAborted(format!(
                "runtime refused merged plan: {e:#}"
            )));
        }

        let record = {
            let inner = self.inner();
            let mut config = inner.config.clone();
            config.sealed = true;
            DurableClusterRecord {
                name: self.name.clone(),
                config,
                plan: Some(durable),
            }
        };
        attempt.stage = SwapStage::Committed;
        if let Err(e) = self.catalog.commit_cluster(self.id, &record).await {
            attempt.stage = SwapStage::Published;
            return Err(SealError::SwapAborted(format!(
                "failed to persist sealed state: {e}"
            )));
        }

        let commands = {
            let mut inner = self.inner();
            // Progress reported while optimizing is newer than the snapshot.
            let mut commands = tracker.initial_commands();
            for df in inner.registry.list() {
                let Some(frontier) = inner.registry.frontier(&df.id) else {
                    continue;
                };
                match tracker.report_progress(df.id, frontier) {
                    Ok(advanced) => commands.extend(advanced),
                    Err(e) => warn!("dropping progress report: {e}"),
                }
            }
            inner.config = record.config;
            inner.tracker = Some(tracker);
            inner.registry.seal_state_mut().finish_seal()?;
            attempt.completed = true;
            self.plan_tx.send_replace(Arc::clone(&running));
            commands
        };
        if let Some(merged) = running.merged() {
            let shared = i64::try_from(merged.shared_arrangements().count()).unwrap_or(i64::MAX);
            self.metrics.shared_arrangements.set(shared);
        }
        if let Some(residency) = running.residency() {
            self.metrics
                .resident_bytes
                .set(i64::try_from(residency.resident_bytes).unwrap_or(i64::MAX));
            self.metrics
                .spilled_bytes
                .set(i64::try_from(residency.spilled_bytes).unwrap_or(i64::MAX));
        }
        self.allow_compaction(commands).await;
        Ok(())
    }

    /// Unseals the cluster.
    ///
    /// Every dataflow returns to its own independent plan, all sharing is
    /// undone, and the cluster accepts dataflow creation and drops again.
    /// Unsealing an unsealed cluster does nothing.
    #[tracing::instrument(level = "info", skip(self), fields(cluster_id = %self.id))]
    pub async fn unseal(&self) -> Result<(), SealError> {
        let ddl = Arc::clone(&self.ddl).lock_owned().await;
        let (running, record) = {
            let inner = self.inner();
            match inner.registry.seal_state() {
                SealState::Unsealed => {
                    debug!("cluster already unsealed");
                    return Ok(());
                }
                SealState::Sealing => return Err(SealError::SealInProgress(self.id)),
                SealState::Sealed => {}
            }
            let mut config = inner.config.clone();
            config.sealed = false;
            let record = DurableClusterRecord {
                name: self.name.clone(),
                config,
                plan: None,
            };
            (
                Arc::new(RunningPlan::independent(&inner.registry.snapshot())),
                record,
            )
        };
        let previous = self.running_plan();

        let cluster = self.detached();
        let metrics = self.metrics.clone();
        let task = tokio::spawn(
            async move {
                let _ddl = ddl;
                cluster
                    .runtime
                    .publish_plan(cluster.id, &running)
                    .await
                    .map_err(|e| {
                        SealError::SwapAborted(format!("runtime refused independent plans: {e:#}"))
                    })?;
                if let Err(e) = cluster.catalog.commit_cluster(cluster.id, &record).await {
                    cluster.restore_runtime(&previous).await;
                    return Err(SealError::SwapAborted(format!(
                        "failed to persist unsealed state: {e}"
                    )));
                }

                {
                    let mut inner = cluster.inner();
                    inner.tracker = None;
                    inner.config = record.config;
                    inner.registry.seal_state_mut().unseal()?;
                    cluster.plan_tx.send_replace(running);
                }
                metrics.unseals.inc();
                metrics.shared_arrangements.set(0);
                info!("unsealed cluster");
                Ok::<_, SealError>(())
            }
            .in_current_span(),
        );
        task.await
            .map_err(|e| SealError::SwapAborted(e.to_string()))?
    }

    fn inner(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Handles to the cluster's state that can outlive `self`'s borrow.
    fn detached(&self) -> Detached {
        Detached {
            id: self.id,
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
            plan_tx: Arc::clone(&self.plan_tx),
            runtime: Arc::clone(&self.runtime),
            catalog: Arc::clone(&self.catalog),
        }
    }

    fn note_rejection(&self, rejected: Rejected) -> Rejected {
        if let Rejected::ClusterSealed(_) = rejected {
            self.metrics.rejected_mutations.inc();
        }
        rejected
    }

    async fn allow_compaction(&self, commands: Vec<CompactionCommand>) {
        if commands.is_empty() {
            return;
        }
        self.metrics
            .compaction_commands
            .inc_by(u64::try_from(commands.len()).unwrap_or(u64::MAX));
        if let Err(e) = self.runtime.allow_compaction(self.id, commands).await {
            warn!(cluster_id = %self.id, "failed to apply compaction frontiers: {e:#}");
        }
    }
}

/// The state of a cluster, for work that runs on its own task.
#[derive(Clone, Debug)]
struct Detached {
    id: ClusterId,
    name: String,
    inner: Arc<Mutex<ClusterInner>>,
    plan_tx: Arc<watch::Sender<Arc<RunningPlan>>>,
    runtime: Arc<dyn ComputeRuntime>,
    catalog: Arc<dyn SealCatalog>,
}

impl Detached {
    fn inner(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Publishes the independent plan of the current dataflow set.
    fn publish_independent(&self) {
        let running = RunningPlan::independent(&self.inner().registry.snapshot());
        self.plan_tx.send_replace(Arc::new(running));
    }

    /// Reinstalls `previous` after a failed swap. The runtime applies plans
    /// atomically, so this only matters if the failure came after the
    /// runtime accepted the new plan.
    async fn restore_runtime(&self, previous: &RunningPlan) {
        if let Err(e) = self.runtime.publish_plan(self.id, previous).await {
            error!(cluster_id = %self.id, "failed to restore previous plan: {e:#}");
        }
    }

    /// Records the cluster as unsealed, without a merged plan.
    async fn persist_unsealed(&self) -> Result<(), CatalogError> {
        let record = {
            let inner = self.inner();
            let mut config = inner.config.clone();
            config.sealed = false;
            DurableClusterRecord {
                name: self.name.clone(),
                config,
                plan: None,
            }
        };
        self.catalog.commit_cluster(self.id, &record).await
    }

    /// Undoes what a seal that reached `stage` changed outside the cluster.
    async fn roll_back(&self, stage: SwapStage, previous: &RunningPlan) {
        if stage >= SwapStage::Published {
            self.restore_runtime(previous).await;
        }
        if stage >= SwapStage::Committed {
            if let Err(e) = self.persist_unsealed().await {
                error!(cluster_id = %self.id, "failed to persist unsealed state: {e}");
            }
        }
    }

    /// Returns a `Sealing` cluster to `Unsealed`. Runs from `Drop`, so it
    /// must not panic.
    fn abort_seal(&self) {
        match self.inner.lock() {
            Ok(mut inner) => {
                if let Err(e) = inner.registry.seal_state_mut().abort_seal() {
                    error!(cluster_id = %self.id, "failed to abort seal: {e}");
                }
            }
            Err(_) => error!(cluster_id = %self.id, "cluster lock poisoned, seal not aborted"),
        }
    }
}

/// How far a seal got in changing state outside the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SwapStage {
    /// Nothing outside the cluster has changed.
    Local,
    /// The runtime may be running the merged plan.
    Published,
    /// The catalog may record the cluster as sealed.
    Committed,
}

/// A seal that has moved its cluster to `Sealing`.
///
/// Dropping an attempt that has not completed returns the cluster to
/// `Unsealed`, whether the seal failed or its caller stopped waiting. If the
/// runtime or the catalog may already have seen the merged plan, the cluster
/// stays `Sealing` until a background task has put the previous state back.
#[derive(Debug)]
struct SealAttempt {
    cluster: Detached,
    metrics: SealMetrics,
    previous: Arc<RunningPlan>,
    stage: SwapStage,
    completed: bool,
}

impl SealAttempt {
    /// Undoes the attempt after a failure. If this is itself cancelled, the
    /// rest of the work moves to a background task.
    async fn revert(mut self) {
        self.cluster.roll_back(self.stage, &self.previous).await;
        self.stage = SwapStage::Local;
    }
}

impl Drop for SealAttempt {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.metrics.seals.with_label_values(&["failed"]).inc();
        if self.stage == SwapStage::Local {
            self.cluster.abort_seal();
            return;
        }

        warn!(cluster_id = %self.cluster.id, "seal interrupted, restoring previous plan");
        let cluster = self.cluster.clone();
        let previous = Arc::clone(&self.previous);
        let stage = self.stage;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    cluster.roll_back(stage, &previous).await;
                    cluster.abort_seal();
                });
            }
            Err(_) => {
                error!(cluster_id = %self.cluster.id, "no runtime to restore previous plan on");
                self.cluster.abort_seal();
            }
        }
    }
}
