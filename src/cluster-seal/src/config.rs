// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tunables for seal-time re-optimization.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of the seal coordinator.
///
/// Missing fields deserialize to their defaults.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    /// Memory available to the merged plan's state on each replica.
    pub memory_budget_bytes: u64,
    /// How long optimization may run before the seal is abandoned.
    pub optimizer_deadline: Duration,
    /// Capacity units used when solving for residency. Larger values waste
    /// less of the budget to rounding and cost more time.
    pub knapsack_buckets: usize,
    /// Whether equal arrangements of a collection are shared.
    pub enable_arrangement_sharing: bool,
    /// Whether equal operators are shared across dataflows.
    pub enable_cse: bool,
}

impl Default for SealConfig {
    fn default() -> Self {
        SealConfig {
            memory_budget_bytes: 4 << 30,
            optimizer_deadline: Duration::from_secs(30),
            knapsack_buckets: 1024,
            enable_arrangement_sharing: true,
            enable_cse: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: SealConfig =
            serde_json::from_str(r#"{"memory_budget_bytes": 1024, "enable_cse": false}"#).unwrap();
        assert_eq!(
            config,
            SealConfig {
                memory_budget_bytes: 1024,
                enable_cse: false,
                ..Default::default()
            }
        );
    }
}
