// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Prometheus monitoring metrics for sealed clusters.
///
/// Metrics are shared by every cluster of a controller.
#[derive(Clone)]
pub struct SealMetrics {
    /// Seal requests, by outcome.
    pub seals: IntCounterVec,
    pub unseals: IntCounter,
    /// Dataflow creations and drops refused because the cluster was sealed.
    pub rejected_mutations: IntCounter,
    pub optimization_seconds: Histogram,
    pub shared_arrangements: IntGauge,
    pub resident_bytes: IntGauge,
    pub spilled_bytes: IntGauge,
    pub compaction_commands: IntCounter,
}

impl std::fmt::Debug for SealMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealMetrics").finish_non_exhaustive()
    }
}

impl SealMetrics {
    /// Returns a new [SealMetrics] instance connected to the given registry.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = SealMetrics {
            seals: IntCounterVec::new(
                Opts::new("mz_cluster_seal_requests_count", "count of seal requests"),
                &["outcome"],
            )?,
            unseals: IntCounter::new(
                "mz_cluster_unseal_count",
                "count of clusters returned to the unsealed state",
            )?,
            rejected_mutations: IntCounter::new(
                "mz_cluster_sealed_rejected_mutations_count",
                "count of dataflow creations and drops refused by sealed clusters",
            )?,
            optimization_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "mz_cluster_seal_optimization_seconds",
                    "time spent re-optimizing a cluster at seal time",
                )
                .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0, 60.0]),
            )?,
            shared_arrangements: IntGauge::new(
                "mz_cluster_seal_shared_arrangements",
                "arrangements read by more than one dataflow in the most recently sealed plan",
            )?,
            resident_bytes: IntGauge::new(
                "mz_cluster_seal_resident_bytes",
                "state kept in memory by the most recently sealed plan",
            )?,
            spilled_bytes: IntGauge::new(
                "mz_cluster_seal_spilled_bytes",
                "state spilled to secondary storage by the most recently sealed plan",
            )?,
            compaction_commands: IntCounter::new(
                "mz_cluster_seal_compaction_commands_count",
                "count of compaction commands issued for shared arrangements",
            )?,
        };
        registry.register(Box::new(metrics.seals.clone()))?;
        registry.register(Box::new(metrics.unseals.clone()))?;
        registry.register(Box::new(metrics.rejected_mutations.clone()))?;
        registry.register(Box::new(metrics.optimization_seconds.clone()))?;
        registry.register(Box::new(metrics.shared_arrangements.clone()))?;
        registry.register(Box::new(metrics.resident_bytes.clone()))?;
        registry.register(Box::new(metrics.spilled_bytes.clone()))?;
        registry.register(Box::new(metrics.compaction_commands.clone()))?;
        Ok(metrics)
    }

    /// Metrics registered nowhere, for callers that do not export them.
    pub fn unregistered() -> Self {
        // Registering into a fresh registry cannot conflict.
        Self::register_into(&Registry::new()).expect("metric names are unique")
    }
}
