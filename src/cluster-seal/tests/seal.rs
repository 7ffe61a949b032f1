// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end tests of sealing, unsealing, and restarting clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use mz_cluster_seal::catalog::{MemCatalog, SealCatalog};
use mz_cluster_seal::controller::{AlterClusterOption, ClusterRow, SealOptionName};
use mz_cluster_seal::eval::{consolidate, evaluate, evaluate_plan, Collection};
use mz_cluster_seal::metrics::SealMetrics;
use mz_cluster_seal::plan::{
    AggregateExpr, AggregateFunc, Partitioning, PhysicalPlan, ResourceHint,
};
use mz_cluster_seal::registry::Dataflow;
use mz_cluster_seal::runtime::{RecordingRuntime, RunningPlan, RuntimeEvent};
use mz_cluster_seal::scalar::{BinaryFunc, Datum, EvalContext, ScalarExpr};
use mz_cluster_seal::state::{ClusterConfig, ClusterVariant};
use mz_cluster_seal::{
    ClusterId, GlobalId, OptimizationError, Rejected, SealConfig, SealController, SealError,
    SealState,
};
use timely::progress::Antichain;

const ORDERS: GlobalId = GlobalId::User(1);
const CUSTOMERS: GlobalId = GlobalId::User(2);
const LINEITEMS: GlobalId = GlobalId::User(3);

struct Harness {
    controller: SealController,
    runtime: Arc<RecordingRuntime>,
    catalog: Arc<MemCatalog>,
    config: SealConfig,
}

impl Harness {
    fn new(config: SealConfig) -> Self {
        Self::with_catalog(config, Arc::new(MemCatalog::new()))
    }

    fn with_catalog(config: SealConfig, catalog: Arc<MemCatalog>) -> Self {
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = SealController::new(
            config.clone(),
            Arc::<RecordingRuntime>::clone(&runtime),
            Arc::<MemCatalog>::clone(&catalog),
            SealMetrics::unregistered(),
        );
        Harness {
            controller,
            runtime,
            catalog,
            config,
        }
    }

    /// A new harness sharing this one's durable state, as after a restart.
    fn restart(&self) -> Harness {
        self.restart_with(self.config.clone())
    }

    /// Like [`Harness::restart`], with a new configuration.
    fn restart_with(&self, config: SealConfig) -> Harness {
        Self::with_catalog(config, Arc::clone(&self.catalog))
    }

    async fn cluster(&self, name: &str) -> ClusterId {
        self.controller
            .create_cluster(name, ClusterConfig::new(ClusterVariant::Unmanaged))
            .await
            .unwrap()
            .id()
    }

    fn publishes(&self) -> usize {
        self.runtime
            .events()
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::Publish { .. }))
            .count()
    }
}

/// A dataflow that arranges `orders` by customer, keeping `projection`, and
/// computes something of its own on top.
fn orders_by_customer(id: u64, projection: Vec<usize>, top: Top) -> Dataflow {
    let mut builder = PhysicalPlan::builder();
    let get = builder.get(ORDERS);
    let arranged = builder.arrange_by(
        get,
        vec![ScalarExpr::column(0)],
        Partitioning::Keyed,
        projection,
        ResourceHint::sized(300),
    );
    match top {
        Top::LargeOrders => {
            builder.filter(
                arranged,
                vec![ScalarExpr::column(2).call_binary(ScalarExpr::literal(100), BinaryFunc::Gt)],
            );
        }
        Top::SpendPerCustomer => {
            builder.reduce(
                arranged,
                vec![ScalarExpr::column(0)],
                vec![AggregateExpr {
                    func: AggregateFunc::SumInt64,
                    expr: ScalarExpr::column(2),
                    distinct: false,
                }],
                ResourceHint::default(),
            );
        }
        Top::SmallAmounts => {
            builder.filter(
                arranged,
                vec![ScalarExpr::column(1).call_binary(ScalarExpr::literal(50), BinaryFunc::Lt)],
            );
        }
    }
    Dataflow::new(
        GlobalId::User(id),
        format!("dataflow_{id}"),
        builder.finish(),
        Antichain::from_elem(0),
    )
}

enum Top {
    LargeOrders,
    SpendPerCustomer,
    SmallAmounts,
}

fn scenario_a_dataflows() -> Vec<Dataflow> {
    vec![
        orders_by_customer(100, vec![0, 1, 2], Top::LargeOrders),
        orders_by_customer(101, vec![0, 1, 2], Top::SpendPerCustomer),
        orders_by_customer(102, vec![0, 2], Top::SmallAmounts),
    ]
}

/// A dataflow that arranges `collection` in memory it may not spill.
fn pinned(id: u64, collection: GlobalId, size_bytes: u64) -> Dataflow {
    arranged(id, collection, size_bytes, false)
}

fn arranged(id: u64, collection: GlobalId, size_bytes: u64, spillable: bool) -> Dataflow {
    let mut builder = PhysicalPlan::builder();
    let get = builder.get(collection);
    builder.arrange_by(
        get,
        vec![ScalarExpr::column(0)],
        Partitioning::Keyed,
        vec![0],
        ResourceHint {
            spillable,
            ..ResourceHint::sized(size_bytes)
        },
    );
    Dataflow::new(
        GlobalId::User(id),
        format!("arranged_{id}"),
        builder.finish(),
        Antichain::from_elem(0),
    )
}

fn orders() -> BTreeMap<GlobalId, Collection> {
    let rows: [(i64, &str, i64); 5] = [
        (1, "widget", 150),
        (1, "gadget", 20),
        (2, "widget", 150),
        (3, "sprocket", 45),
        (3, "sprocket", 45),
    ];
    let orders = consolidate(rows.iter().map(|(customer, item, amount)| {
        (
            vec![
                Datum::from(*customer),
                Datum::from(*item),
                Datum::from(*amount),
            ],
            1,
        )
    }));
    BTreeMap::from([(ORDERS, orders)])
}

fn config() -> SealConfig {
    SealConfig {
        memory_budget_bytes: 10_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_shared_arrangement_cuts_memory() {
    let harness = Harness::new(config());
    let id = harness.cluster("analytics").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    let baseline = cluster.running_plan().resident_bytes();
    assert_eq!(baseline, 900);

    harness.controller.alter_cluster_sealed(id, true).await.unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);

    let running = cluster.running_plan();
    let merged = running.merged().expect("sealed cluster runs a merged plan");
    let shared: Vec<_> = merged.shared_arrangements().collect();
    assert_eq!(shared.len(), 1);
    let (slot, arrangement) = shared[0];
    assert_eq!(
        arrangement.consumers,
        BTreeSet::from([GlobalId::User(100), GlobalId::User(101), GlobalId::User(102)])
    );
    assert_eq!(running.resident_bytes(), 300);
    assert_eq!(running.resident_bytes() * 3, baseline);

    // Every dataflow still computes exactly what it computed on its own.
    let inputs = orders();
    let ctx = EvalContext::default();
    for dataflow in scenario_a_dataflows() {
        let expected = evaluate_plan(&dataflow.plan, &inputs, &ctx).unwrap();
        let root = merged.roots[&dataflow.id];
        let actual = evaluate(|i| merged.op(i), root, &inputs, &ctx).unwrap();
        assert_eq!(actual, expected, "output of {}", dataflow.id);
    }

    assert_eq!(
        harness.controller.mz_clusters(),
        vec![ClusterRow {
            id: "u1".into(),
            name: "analytics".into(),
            sealed: true,
        }]
    );
    assert_eq!(
        harness.runtime.published(id).as_ref(),
        Some(running.as_ref())
    );

    // The shared arrangement compacts to the slowest of its consumers.
    assert_eq!(cluster.compaction_frontier(slot), Some(Antichain::from_elem(0)));
    let mut since = cluster.subscribe_compaction(slot).unwrap();
    cluster
        .report_progress(GlobalId::User(100), Antichain::from_elem(5))
        .await
        .unwrap();
    cluster
        .report_progress(GlobalId::User(101), Antichain::from_elem(7))
        .await
        .unwrap();
    assert_eq!(cluster.compaction_frontier(slot), Some(Antichain::from_elem(0)));
    cluster
        .report_progress(GlobalId::User(102), Antichain::from_elem(3))
        .await
        .unwrap();
    assert_eq!(cluster.compaction_frontier(slot), Some(Antichain::from_elem(3)));
    assert_eq!(*since.borrow_and_update(), Antichain::from_elem(3));
    assert!(harness.runtime.events().iter().any(|e| matches!(
        e,
        RuntimeEvent::Compaction(_, commands)
            if commands.iter().any(|c| c.slot == slot && c.since == Antichain::from_elem(3))
    )));

    assert!(matches!(
        cluster
            .report_progress(GlobalId::User(999), Antichain::from_elem(3))
            .await,
        Err(mz_cluster_seal::TrackerError::UnknownDataflow(GlobalId::User(999)))
    ));
}

#[tokio::test]
async fn test_dataflow_set_is_frozen_while_sealing() {
    let harness = Harness::new(config());
    let id = harness.cluster("frozen").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    let version = cluster.registry_version();
    let before = cluster.dataflows();

    harness.runtime.pause_publish();
    let sealing = tokio::spawn({
        let cluster = Arc::clone(&cluster);
        async move { cluster.seal().await }
    });
    harness.runtime.publish_started().await;
    assert_eq!(cluster.seal_state(), SealState::Sealing);

    let late = orders_by_customer(103, vec![0, 1, 2], Top::LargeOrders);
    assert_eq!(
        harness.controller.create_dataflow(id, late.clone()).await,
        Err(Rejected::ClusterSealed(id))
    );
    assert_eq!(
        harness
            .controller
            .drop_dataflow(id, GlobalId::User(100))
            .await,
        Err(Rejected::ClusterSealed(id))
    );
    assert_eq!(cluster.seal().await, Err(SealError::SealInProgress(id)));
    assert_eq!(cluster.unseal().await, Err(SealError::SealInProgress(id)));
    // Progress is still processed mid-seal.
    cluster
        .report_progress(GlobalId::User(100), Antichain::from_elem(4))
        .await
        .unwrap();
    assert_eq!(cluster.registry_version(), version);
    assert_eq!(cluster.dataflows(), before);
    // Readers keep seeing the independent plans until the swap.
    assert!(!cluster.running_plan().is_merged());

    harness.runtime.resume_publish();
    sealing.await.unwrap().unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    assert_eq!(
        harness.controller.create_dataflow(id, late).await,
        Err(Rejected::ClusterSealed(id))
    );
    assert_eq!(cluster.registry_version(), version);
    assert!(harness
        .runtime
        .events()
        .iter()
        .all(|e| *e != RuntimeEvent::Install(id, GlobalId::User(103))));
}

#[tokio::test]
async fn test_unresolvable_budget_keeps_cluster_unsealed() {
    let harness = Harness::new(SealConfig {
        memory_budget_bytes: 1000,
        ..Default::default()
    });
    let id = harness.cluster("tight").await;
    harness
        .controller
        .create_dataflow(id, pinned(100, ORDERS, 600))
        .await
        .unwrap();
    harness
        .controller
        .create_dataflow(id, pinned(101, CUSTOMERS, 600))
        .await
        .unwrap();
    let cluster = harness.controller.cluster(id).unwrap();
    let before = cluster.running_plan();

    let result = harness.controller.alter_cluster_sealed(id, true).await;
    assert_eq!(
        result,
        Err(SealError::OptimizationFailed(
            OptimizationError::BudgetExceeded {
                required: 1200,
                available: 1000,
            }
        ))
    );
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    assert!(Arc::ptr_eq(&cluster.running_plan(), &before));
    assert_eq!(harness.publishes(), 0);
    assert!(!cluster.cluster_config().sealed);
    let record = harness.catalog.load_cluster(id).await.unwrap();
    assert!(!record.config.sealed);
    assert_eq!(record.plan, None);

    // The cluster accepts dataflows again.
    harness
        .controller
        .create_dataflow(id, pinned(102, ORDERS, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_commit_restores_previous_plan() {
    let harness = Harness::new(config());
    let id = harness.cluster("flaky").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    let before = cluster.running_plan();

    harness.catalog.fail_next_commit();
    let result = cluster.seal().await;
    assert!(matches!(result, Err(SealError::SwapAborted(_))), "{result:?}");
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    assert!(Arc::ptr_eq(&cluster.running_plan(), &before));
    assert_eq!(harness.runtime.published(id).as_ref(), Some(before.as_ref()));

    // A later attempt succeeds.
    cluster.seal().await.unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
}

#[tokio::test]
async fn test_runtime_refusal_aborts_seal() {
    let harness = Harness::new(config());
    let id = harness.cluster("refused").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    harness.runtime.fail_next_publish();
    assert!(matches!(
        cluster.seal().await,
        Err(SealError::SwapAborted(_))
    ));
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    assert!(!cluster.running_plan().is_merged());
    assert!(!harness.catalog.load_cluster(id).await.unwrap().config.sealed);
}

#[tokio::test]
async fn test_optimizer_deadline_keeps_cluster_unsealed() {
    let harness = Harness::new(SealConfig {
        optimizer_deadline: Duration::ZERO,
        ..config()
    });
    let id = harness.cluster("hurried").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    let before = cluster.running_plan();

    assert_eq!(
        harness.controller.alter_cluster_sealed(id, true).await,
        Err(SealError::OptimizationFailed(
            OptimizationError::DeadlineExceeded(Duration::ZERO)
        ))
    );
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    assert!(Arc::ptr_eq(&cluster.running_plan(), &before));
    assert_eq!(harness.publishes(), 0);
    assert!(!harness.catalog.load_cluster(id).await.unwrap().config.sealed);
    harness
        .controller
        .drop_dataflow(id, GlobalId::User(102))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_seal_reverts_to_unsealed() {
    let harness = Harness::new(config());
    let id = harness.cluster("impatient").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    let before = cluster.running_plan();

    // The caller stops waiting while the runtime is installing the merged plan.
    harness.runtime.pause_publish();
    tokio::select! {
        result = cluster.seal() => panic!("seal finished while publication was paused: {result:?}"),
        () = harness.runtime.publish_started() => {}
    }
    // Frozen until the runtime is back on the previous plan.
    assert_eq!(cluster.seal_state(), SealState::Sealing);
    harness.runtime.resume_publish();
    tokio::time::timeout(Duration::from_secs(10), async {
        while cluster.seal_state() != SealState::Unsealed {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancelled seal was never reverted");

    assert!(Arc::ptr_eq(&cluster.running_plan(), &before));
    assert_eq!(harness.runtime.published(id).as_ref(), Some(before.as_ref()));
    let record = harness.catalog.load_cluster(id).await.unwrap();
    assert!(!record.config.sealed);
    assert_eq!(record.plan, None);

    // Nothing is left wedged.
    harness
        .controller
        .create_dataflow(id, orders_by_customer(103, vec![0, 1, 2], Top::LargeOrders))
        .await
        .unwrap();
    cluster.unseal().await.unwrap();
    cluster.seal().await.unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    assert_eq!(cluster.running_plan().dataflows().len(), 4);
}

#[tokio::test]
async fn test_interrupted_create_still_reaches_runtime() {
    let harness = Harness::new(config());
    let id = harness.cluster("interrupted").await;
    let cluster = harness.controller.cluster(id).unwrap();

    // The caller gives up as soon as the statement first yields.
    let dataflow = orders_by_customer(100, vec![0, 1, 2], Top::LargeOrders);
    let _ = tokio::time::timeout(
        Duration::ZERO,
        harness.controller.create_dataflow(id, dataflow),
    )
    .await;

    // The next statement waits for the interrupted one to finish.
    cluster.seal().await.unwrap();
    assert_eq!(cluster.dataflows().len(), 1);
    assert!(harness
        .runtime
        .events()
        .contains(&RuntimeEvent::Install(id, GlobalId::User(100))));
    assert_eq!(cluster.running_plan().dataflows(), vec![GlobalId::User(100)]);
}

#[tokio::test]
async fn test_failed_drop_keeps_recorded_progress() {
    let harness = Harness::new(config());
    let id = harness.cluster("sticky").await;
    harness
        .controller
        .create_dataflow(id, pinned(100, ORDERS, 100))
        .await
        .unwrap();
    let cluster = harness.controller.cluster(id).unwrap();
    cluster
        .report_progress(GlobalId::User(100), Antichain::from_elem(5))
        .await
        .unwrap();

    harness.runtime.fail_next_remove();
    let result = harness
        .controller
        .drop_dataflow(id, GlobalId::User(100))
        .await;
    assert!(
        matches!(result, Err(Rejected::Runtime { id: GlobalId::User(100), .. })),
        "{result:?}"
    );
    assert_eq!(cluster.dataflows().len(), 1);

    // The seal starts from the frontier the dataflow had reached.
    cluster.seal().await.unwrap();
    let slot = cluster
        .running_plan()
        .merged()
        .unwrap()
        .arrangements()
        .next()
        .unwrap()
        .0;
    assert_eq!(cluster.compaction_frontier(slot), Some(Antichain::from_elem(5)));
}

#[tokio::test]
async fn test_sealing_sealed_cluster_is_noop() {
    let harness = Harness::new(config());
    let id = harness.cluster("twice").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let option = AlterClusterOption::Set {
        name: SealOptionName::Sealed,
        value: None,
    };
    harness.controller.alter_cluster(id, option).await.unwrap();
    let cluster = harness.controller.cluster(id).unwrap();
    let sealed = cluster.running_plan();

    harness.controller.alter_cluster(id, option).await.unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    assert!(Arc::ptr_eq(&cluster.running_plan(), &sealed));
    assert_eq!(harness.publishes(), 1);
}

#[tokio::test]
async fn test_unseal_restores_independent_plans() {
    let harness = Harness::new(config());
    let id = harness.cluster("reversible").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    let cluster = harness.controller.cluster(id).unwrap();
    cluster.seal().await.unwrap();
    let slot = cluster
        .running_plan()
        .merged()
        .unwrap()
        .shared_arrangements()
        .next()
        .unwrap()
        .0;
    assert!(cluster.compaction_frontier(slot).is_some());

    harness
        .controller
        .alter_cluster(id, AlterClusterOption::Reset(SealOptionName::Sealed))
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    let running = cluster.running_plan();
    assert!(matches!(running.as_ref(), RunningPlan::Independent { .. }));
    assert_eq!(running.resident_bytes(), 900);
    assert_eq!(cluster.compaction_frontier(slot), None);
    assert_eq!(harness.runtime.published(id).as_ref(), Some(running.as_ref()));

    let record = harness.catalog.load_cluster(id).await.unwrap();
    assert!(!record.config.sealed);
    assert_eq!(record.plan, None);
    assert!(!harness.controller.mz_clusters()[0].sealed);

    // Unsealing again changes nothing; the dataflow set is open again.
    cluster.unseal().await.unwrap();
    harness
        .controller
        .create_dataflow(id, orders_by_customer(103, vec![0, 1, 2], Top::LargeOrders))
        .await
        .unwrap();
    harness
        .controller
        .drop_dataflow(id, GlobalId::User(100))
        .await
        .unwrap();
    assert_eq!(cluster.dataflows().len(), 3);
}

#[tokio::test]
async fn test_restart_resumes_sealed_plan() {
    let harness = Harness::new(config());
    let id = harness.cluster("durable").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    harness.controller.alter_cluster_sealed(id, true).await.unwrap();
    let sealed = harness.controller.cluster(id).unwrap().running_plan();

    let restarted = harness.restart();
    let cluster = restarted
        .controller
        .open_cluster(id, scenario_a_dataflows())
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    assert_eq!(cluster.running_plan(), sealed);
    assert_eq!(restarted.runtime.published(id).as_ref(), Some(sealed.as_ref()));
    assert_eq!(
        restarted.controller.create_dataflow(id, pinned(200, ORDERS, 1)).await,
        Err(Rejected::ClusterSealed(id))
    );
    assert!(restarted.controller.mz_clusters()[0].sealed);

    // New clusters do not reuse the restored cluster's id.
    let next = restarted.cluster("fresh").await;
    assert_ne!(next, id);
}

#[tokio::test]
async fn test_restart_with_changed_dataflows_reseals() {
    let harness = Harness::new(config());
    let id = harness.cluster("drifted").await;
    for dataflow in scenario_a_dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    harness.controller.alter_cluster_sealed(id, true).await.unwrap();

    let restarted = harness.restart();
    let mut dataflows = scenario_a_dataflows();
    dataflows.pop();
    let cluster = restarted
        .controller
        .open_cluster(id, dataflows)
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    let running = cluster.running_plan();
    assert_eq!(
        running.dataflows(),
        vec![GlobalId::User(100), GlobalId::User(101)]
    );
    let record = restarted.catalog.load_cluster(id).await.unwrap();
    let roots: Vec<_> = record.plan.unwrap().roots.into_iter().map(|(id, _)| id).collect();
    assert_eq!(roots, vec![GlobalId::User(100), GlobalId::User(101)]);
}

#[tokio::test]
async fn test_failed_reseal_opens_unsealed() {
    let harness = Harness::new(config());
    let id = harness.cluster("outgrown").await;
    harness
        .controller
        .create_dataflow(id, pinned(100, ORDERS, 600))
        .await
        .unwrap();
    harness
        .controller
        .create_dataflow(id, pinned(101, CUSTOMERS, 600))
        .await
        .unwrap();
    harness.controller.alter_cluster_sealed(id, true).await.unwrap();

    // A third dataflow appeared and the budget shrank: 1 800 pinned bytes
    // cannot fit in 1 500.
    let restarted = harness.restart_with(SealConfig {
        memory_budget_bytes: 1_500,
        ..Default::default()
    });
    let dataflows = vec![
        pinned(100, ORDERS, 600),
        pinned(101, CUSTOMERS, 600),
        pinned(102, LINEITEMS, 600),
    ];
    let cluster = restarted
        .controller
        .open_cluster(id, dataflows)
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    let running = cluster.running_plan();
    assert!(!running.is_merged());
    assert_eq!(
        running.dataflows(),
        vec![GlobalId::User(100), GlobalId::User(101), GlobalId::User(102)]
    );
    assert_eq!(restarted.runtime.published(id).as_ref(), Some(running.as_ref()));
    assert!(restarted.controller.cluster(id).is_some());
    assert!(!restarted.controller.mz_clusters()[0].sealed);
    let record = restarted.catalog.load_cluster(id).await.unwrap();
    assert!(!record.config.sealed);
    assert_eq!(record.plan, None);

    // The cluster serves DDL, and the next restart opens it as is.
    restarted
        .controller
        .drop_dataflow(id, GlobalId::User(102))
        .await
        .unwrap();
    let again = restarted.restart();
    let cluster = again
        .controller
        .open_cluster(id, vec![pinned(100, ORDERS, 600), pinned(101, CUSTOMERS, 600)])
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
}

#[tokio::test]
async fn test_restart_under_smaller_budget_reseals() {
    let dataflows = || {
        vec![
            arranged(100, ORDERS, 600, true),
            arranged(101, CUSTOMERS, 600, true),
        ]
    };
    let harness = Harness::new(config());
    let id = harness.cluster("shrunk").await;
    for dataflow in dataflows() {
        harness.controller.create_dataflow(id, dataflow).await.unwrap();
    }
    harness.controller.alter_cluster_sealed(id, true).await.unwrap();
    let sealed = harness.controller.cluster(id).unwrap().running_plan();
    assert_eq!(sealed.resident_bytes(), 1_200);

    let restarted = harness.restart_with(SealConfig {
        memory_budget_bytes: 1_000,
        ..Default::default()
    });
    let cluster = restarted
        .controller
        .open_cluster(id, dataflows())
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Sealed);
    let running = cluster.running_plan();
    assert_eq!(running.resident_bytes(), 600);
    let residency = running.residency().unwrap();
    assert_eq!(residency.spilled_slots().count(), 1);
    assert_eq!(residency.budget_bytes, 1_000);
    let record = restarted.catalog.load_cluster(id).await.unwrap();
    assert_eq!(record.plan.unwrap().residency.resident_bytes, 600);
}

#[tokio::test]
async fn test_legacy_record_opens_unsealed() {
    let catalog = Arc::new(MemCatalog::new());
    catalog.insert_raw(
        ClusterId::User(4),
        r#"{"name": "old", "config": {"workload_class": "etl", "variant": "Unmanaged"}}"#,
    );
    let harness = Harness::with_catalog(config(), catalog);
    let cluster = harness
        .controller
        .open_cluster(ClusterId::User(4), scenario_a_dataflows())
        .await
        .unwrap();
    assert_eq!(cluster.seal_state(), SealState::Unsealed);
    assert_eq!(cluster.cluster_config().workload_class.as_deref(), Some("etl"));
    assert_eq!(cluster.dataflows().len(), 3);
    assert_eq!(
        harness.controller.mz_clusters(),
        vec![ClusterRow {
            id: "u4".into(),
            name: "old".into(),
            sealed: false,
        }]
    );
}

#[tokio::test]
async fn test_missing_cluster() {
    let harness = Harness::new(config());
    assert_eq!(
        harness
            .controller
            .alter_cluster_sealed(ClusterId::User(9), true)
            .await,
        Err(SealError::ClusterMissing(ClusterId::User(9)))
    );
    assert_eq!(
        harness
            .controller
            .create_dataflow(ClusterId::User(9), pinned(1, ORDERS, 1))
            .await,
        Err(Rejected::ClusterMissing(ClusterId::User(9)))
    );
    assert!(matches!(
        harness
            .controller
            .open_cluster(ClusterId::User(9), Vec::new())
            .await,
        Err(SealError::ClusterMissing(ClusterId::User(9)))
    ));
}
