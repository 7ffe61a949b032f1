// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors returned by sealed-cluster management.
//!
//! Each public operation returns an error type listing exactly the failures it
//! can produce. None of these errors is fatal: a refused mutation or a failed
//! seal leaves the cluster running its previous plan. Conditions that could
//! lose data, such as a compaction frontier moving backwards, are not errors
//! at all; they are bugs and panic.

use std::time::Duration;

use thiserror::Error;

use crate::id::{ClusterId, GlobalId};
use crate::plan::PlanError;
use crate::state::TransitionError;

/// Error returned in response to a request to create or drop a dataflow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    /// The cluster is sealed or being sealed, so its dataflow set is frozen.
    #[error("cluster {0} is sealed: dataflows cannot be created or dropped")]
    ClusterSealed(ClusterId),
    #[error("cluster does not exist: {0}")]
    ClusterMissing(ClusterId),
    #[error("dataflow exists already: {0}")]
    DataflowExists(GlobalId),
    #[error("dataflow does not exist: {0}")]
    DataflowMissing(GlobalId),
    #[error("invalid plan for dataflow {id}: {error}")]
    InvalidPlan { id: GlobalId, error: PlanError },
    /// The compute runtime refused to install or remove the dataflow.
    #[error("compute runtime refused dataflow {id}: {reason}")]
    Runtime { id: GlobalId, reason: String },
}

/// Errors arising while building the merged plan of a cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptimizationError {
    #[error("merged plan is cyclic: slot {node} reads slot {input}")]
    Cycle { node: usize, input: usize },
    /// Even with every spillable node spilled, the nodes that must stay
    /// resident do not fit.
    #[error("memory budget exceeded: {required} bytes must be resident, {available} available")]
    BudgetExceeded { required: u64, available: u64 },
    #[error("re-optimization exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("dataflow {0} has no root in the merged plan")]
    MissingRoot(GlobalId),
    #[error("shared arrangement at slot {0} has no consumers")]
    OrphanedArrangement(usize),
    #[error("internal optimizer error: {0}")]
    Internal(String),
}

/// Errors arising while sealing or unsealing a cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("optimization failed: {0}")]
    OptimizationFailed(#[from] OptimizationError),
    /// Optimization succeeded, but installing its result did not.
    #[error("plan swap aborted: {0}")]
    SwapAborted(String),
    #[error("cluster {0} is already being sealed")]
    SealInProgress(ClusterId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("cluster does not exist: {0}")]
    ClusterMissing(ClusterId),
    /// The cluster's durable record could not be read.
    #[error("catalog error: {0}")]
    Catalog(String),
}

impl From<CatalogError> for SealError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::ClusterMissing(id) => SealError::ClusterMissing(id),
            error => SealError::Catalog(error.to_string()),
        }
    }
}

/// Errors arising while processing a progress report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("progress reported for unknown dataflow: {0}")]
    UnknownDataflow(GlobalId),
}

/// Errors returned by a [`SealCatalog`](crate::catalog::SealCatalog).
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("no durable record for cluster {0}")]
    ClusterMissing(ClusterId),
    #[error("failed to (de)serialize cluster record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
