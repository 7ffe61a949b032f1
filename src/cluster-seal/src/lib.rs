// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sealed clusters.
//!
//! A cluster whose set of dataflows will not change can be sealed. Sealing
//! freezes the dataflow set and re-optimizes all of its dataflows together:
//! equal arrangements of a collection are kept once, common operators are
//! computed once, shared arrangements compact as soon as every consumer allows
//! it, and the resulting state is fit into the cluster's memory budget.
//! Unsealing returns every dataflow to its own plan.

pub mod budget;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod controller;
pub mod coord;
pub mod cse;
pub mod error;
pub mod eval;
pub mod frontier;
pub mod id;
pub mod metrics;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod scalar;
pub mod sharing;
pub mod state;

pub use crate::config::SealConfig;
pub use crate::controller::SealController;
pub use crate::coord::{Cluster, SealCoordinator};
pub use crate::error::{OptimizationError, Rejected, SealError, TrackerError};
pub use crate::id::{ClusterId, GlobalId};
pub use crate::state::SealState;
