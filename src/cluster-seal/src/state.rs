// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The seal state of a cluster and its persisted configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The seal state of a cluster.
///
/// ```text
///            seal request            optimization + swap ok
/// Unsealed ───────────────► Sealing ────────────────────────► Sealed
///    ▲                         │                                │
///    └──── failure / abort ────┘                                │
///    └──────────────────────────── unseal ──────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SealState {
    /// Dataflows may be installed and removed freely.
    Unsealed,
    /// Re-optimization is in progress. Dataflow mutations are refused.
    Sealing,
    /// The dataflow set is frozen and the merged plan is authoritative.
    Sealed,
}

impl SealState {
    /// Reports whether dataflows may be installed or removed in this state.
    pub fn allows_mutation(&self) -> bool {
        matches!(self, SealState::Unsealed)
    }
}

impl fmt::Display for SealState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SealState::Unsealed => f.write_str("unsealed"),
            SealState::Sealing => f.write_str("sealing"),
            SealState::Sealed => f.write_str("sealed"),
        }
    }
}

/// Error returned in response to a state transition the state machine does not
/// allow.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid seal state transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: SealState,
    pub to: SealState,
}

/// The state machine guarding a cluster's seal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSealState {
    state: SealState,
}

impl Default for ClusterSealState {
    fn default() -> Self {
        ClusterSealState {
            state: SealState::Unsealed,
        }
    }
}

impl ClusterSealState {
    /// Creates a state machine in `state`.
    ///
    /// Only a cluster restored from durable state starts out anywhere but
    /// `Unsealed`, and a persisted state is never `Sealing`.
    pub fn restored(sealed: bool) -> Self {
        ClusterSealState {
            state: if sealed {
                SealState::Sealed
            } else {
                SealState::Unsealed
            },
        }
    }

    /// The current state.
    pub fn get(&self) -> SealState {
        self.state
    }

    /// Moves to `Sealing` upon a seal request.
    pub fn begin_seal(&mut self) -> Result<(), TransitionError> {
        self.transition(SealState::Unsealed, SealState::Sealing)
    }

    /// Moves to `Sealed` once the merged plan has been swapped in.
    pub fn finish_seal(&mut self) -> Result<(), TransitionError> {
        self.transition(SealState::Sealing, SealState::Sealed)
    }

    /// Moves back to `Unsealed` after a failed seal attempt.
    pub fn abort_seal(&mut self) -> Result<(), TransitionError> {
        self.transition(SealState::Sealing, SealState::Unsealed)
    }

    /// Moves from `Sealed` back to `Unsealed`, once all sharing has been
    /// undone.
    pub fn unseal(&mut self) -> Result<(), TransitionError> {
        self.transition(SealState::Sealed, SealState::Unsealed)
    }

    fn transition(&mut self, from: SealState, to: SealState) -> Result<(), TransitionError> {
        if self.state != from {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        tracing::debug!(%from, %to, "seal state transition");
        self.state = to;
        Ok(())
    }
}

/// Replica logging configuration of a managed cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplicaLogging {
    pub log_logging: bool,
    pub interval_ms: Option<u64>,
}

/// The configuration of a managed cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ManagedCluster {
    pub size: String,
    pub replication_factor: u32,
    pub availability_zones: Vec<String>,
    pub logging: ReplicaLogging,
}

/// Whether the system manages the cluster's replicas.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClusterVariant {
    Managed(ManagedCluster),
    Unmanaged,
}

/// The persisted configuration of a cluster.
///
/// `sealed` is a top-level property, a sibling of `workload_class`, so that it
/// applies to managed and unmanaged clusters alike. Records written before
/// the property existed are read as a [`LegacyClusterConfig`] and upgraded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub workload_class: Option<String>,
    pub variant: ClusterVariant,
    pub sealed: bool,
}

impl ClusterConfig {
    /// The configuration of a new, unsealed cluster.
    pub fn new(variant: ClusterVariant) -> Self {
        ClusterConfig {
            workload_class: None,
            variant,
            sealed: false,
        }
    }
}

/// A cluster configuration as persisted before the `sealed` property existed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LegacyClusterConfig {
    pub workload_class: Option<String>,
    pub variant: ClusterVariant,
}

/// Upgrades a legacy configuration. Every existing cluster is unsealed.
pub fn upgrade_legacy_config(legacy: LegacyClusterConfig) -> ClusterConfig {
    ClusterConfig {
        workload_class: legacy.workload_class,
        variant: legacy.variant,
        sealed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = ClusterSealState::default();
        assert_eq!(state.get(), SealState::Unsealed);
        state.begin_seal().unwrap();
        assert!(!state.get().allows_mutation());
        state.finish_seal().unwrap();
        assert_eq!(state.get(), SealState::Sealed);
        state.unseal().unwrap();
        assert_eq!(state.get(), SealState::Unsealed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = ClusterSealState::default();
        assert_eq!(
            state.finish_seal(),
            Err(TransitionError {
                from: SealState::Unsealed,
                to: SealState::Sealed
            })
        );
        assert!(state.unseal().is_err());
        state.begin_seal().unwrap();
        assert!(state.begin_seal().is_err());
        state.abort_seal().unwrap();
        assert_eq!(state.get(), SealState::Unsealed);

        let mut sealed = ClusterSealState::restored(true);
        assert!(sealed.begin_seal().is_err());
        assert!(sealed.abort_seal().is_err());
    }

    #[test]
    fn test_config_requires_sealed() {
        let json = r#"{"workload_class":null,"variant":"Unmanaged"}"#;
        assert!(serde_json::from_str::<ClusterConfig>(json).is_err());
        let legacy: LegacyClusterConfig = serde_json::from_str(json).unwrap();
        assert!(!upgrade_legacy_config(legacy).sealed);

        let sealed = ClusterConfig {
            sealed: true,
            ..ClusterConfig::new(ClusterVariant::Unmanaged)
        };
        let json = serde_json::to_string(&sealed).unwrap();
        assert_eq!(serde_json::from_str::<ClusterConfig>(&json).unwrap(), sealed);
    }

    #[test]
    fn test_upgrade_legacy_config() {
        let legacy = LegacyClusterConfig {
            workload_class: Some("production".into()),
            variant: ClusterVariant::Managed(ManagedCluster {
                size: "100cc".into(),
                replication_factor: 2,
                availability_zones: vec!["use1-az1".into()],
                logging: ReplicaLogging::default(),
            }),
        };
        let upgraded = upgrade_legacy_config(legacy.clone());
        assert!(!upgraded.sealed);
        assert_eq!(upgraded.workload_class, legacy.workload_class);
        assert_eq!(upgraded.variant, legacy.variant);
    }
}
