// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The entry point for managing the clusters of an environment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::SealCatalog;
use crate::config::SealConfig;
use crate::coord::Cluster;
use crate::error::{Rejected, SealError};
use crate::id::{ClusterId, GlobalId};
use crate::metrics::SealMetrics;
use crate::registry::Dataflow;
use crate::runtime::ComputeRuntime;
use crate::state::ClusterConfig;

/// The name of a cluster option that controls sealing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SealOptionName {
    Sealed,
    Unsealed,
}

impl fmt::Display for SealOptionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SealOptionName::Sealed => f.write_str("SEALED"),
            SealOptionName::Unsealed => f.write_str("UNSEALED"),
        }
    }
}

/// A sealing option of `ALTER CLUSTER`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlterClusterOption {
    /// `SET (<name> [= <value>])`. A bare option name means `true`.
    Set {
        name: SealOptionName,
        value: Option<bool>,
    },
    /// `RESET (<name>)`, restoring the default of unsealed.
    Reset(SealOptionName),
}

/// The seal state an `ALTER CLUSTER` statement asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SealRequest {
    pub sealed: bool,
}

impl SealRequest {
    pub fn from_option(option: AlterClusterOption) -> SealRequest {
        let sealed = match option {
            AlterClusterOption::Set {
                name: SealOptionName::Sealed,
                value,
            } => value.unwrap_or(true),
            AlterClusterOption::Set {
                name: SealOptionName::Unsealed,
                value,
            } => !value.unwrap_or(true),
            AlterClusterOption::Reset(_) => false,
        };
        SealRequest { sealed }
    }
}

/// A row of the `mz_clusters` introspection relation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterRow {
    pub id: String,
    pub name: String,
    pub sealed: bool,
}

/// Manages the clusters of an environment.
#[derive(Debug)]
pub struct SealController {
    clusters: Mutex<BTreeMap<ClusterId, Arc<Cluster>>>,
    next_user_id: Mutex<u64>,
    config: SealConfig,
    runtime: Arc<dyn ComputeRuntime>,
    catalog: Arc<dyn SealCatalog>,
    metrics: SealMetrics,
}

impl SealController {
    pub fn new(
        config: SealConfig,
        runtime: Arc<dyn ComputeRuntime>,
        catalog: Arc<dyn SealCatalog>,
        metrics: SealMetrics,
    ) -> Self {
        SealController {
            clusters: Mutex::new(BTreeMap::new()),
            next_user_id: Mutex::new(1),
            config,
            runtime,
            catalog,
            metrics,
        }
    }

    /// Creates an unsealed user cluster.
    pub async fn create_cluster(
        &self,
        name: &str,
        config: ClusterConfig,
    ) -> Result<Arc<Cluster>, SealError> {
        let id = {
            let mut next = self.next_user_id.lock().expect("lock poisoned");
            let id = ClusterId::User(*next);
            *next += 1;
            id
        };
        let cluster = Cluster::create(
            id,
            name,
            config,
            self.config.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.catalog),
            self.metrics.clone(),
        )
        .await?;
        Ok(self.insert(cluster))
    }

    /// Restores cluster `id` and its dataflows from the catalog.
    pub async fn open_cluster(
        &self,
        id: ClusterId,
        dataflows: Vec<Dataflow>,
    ) -> Result<Arc<Cluster>, SealError> {
        let cluster = Cluster::open(
            id,
            dataflows,
            self.config.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.catalog),
            self.metrics.clone(),
        )
        .await?;
        if let ClusterId::User(n) = id {
            let mut next = self.next_user_id.lock().expect("lock poisoned");
            *next = (*next).max(n + 1);
        }
        Ok(self.insert(cluster))
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Arc<Cluster>> {
        self.clusters
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Creates a dataflow on cluster `cluster_id`.
    pub async fn create_dataflow(
        &self,
        cluster_id: ClusterId,
        dataflow: Dataflow,
    ) -> Result<(), Rejected> {
        let cluster = self
            .cluster(cluster_id)
            .ok_or(Rejected::ClusterMissing(cluster_id))?;
        cluster.install_dataflow(dataflow).await
    }

    /// Drops dataflow `id` from cluster `cluster_id`.
    pub async fn drop_dataflow(&self, cluster_id: ClusterId, id: GlobalId) -> Result<(), Rejected> {
        let cluster = self
            .cluster(cluster_id)
            .ok_or(Rejected::ClusterMissing(cluster_id))?;
        cluster.remove_dataflow(id).await
    }

    /// Moves cluster `cluster_id` to the requested seal state.
    ///
    /// Requests that match the current state succeed without effect.
    pub async fn alter_cluster_sealed(
        &self,
        cluster_id: ClusterId,
        desired: bool,
    ) -> Result<(), SealError> {
        let cluster = self
            .cluster(cluster_id)
            .ok_or(SealError::ClusterMissing(cluster_id))?;
        info!(%cluster_id, sealed = desired, "altering cluster");
        if desired {
            cluster.seal().await
        } else {
            cluster.unseal().await
        }
    }

    /// Applies one sealing option of `ALTER CLUSTER`.
    pub async fn alter_cluster(
        &self,
        cluster_id: ClusterId,
        option: AlterClusterOption,
    ) -> Result<(), SealError> {
        let request = SealRequest::from_option(option);
        self.alter_cluster_sealed(cluster_id, request.sealed).await
    }

    /// The contents of the `mz_clusters` introspection relation.
    pub fn mz_clusters(&self) -> Vec<ClusterRow> {
        let clusters: Vec<_> = self
            .clusters
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        clusters
            .iter()
            .map(|cluster| ClusterRow {
                id: cluster.id().to_string(),
                name: cluster.name().to_string(),
                sealed: cluster.cluster_config().sealed,
            })
            .collect()
    }

    fn insert(&self, cluster: Cluster) -> Arc<Cluster> {
        let cluster = Arc::new(cluster);
        self.clusters
            .lock()
            .expect("lock poisoned")
            .insert(cluster.id(), Arc::clone(&cluster));
        cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alter_options() {
        let cases = [
            (
                AlterClusterOption::Set {
                    name: SealOptionName::Sealed,
                    value: None,
                },
                true,
            ),
            (
                AlterClusterOption::Set {
                    name: SealOptionName::Sealed,
                    value: Some(false),
                },
                false,
            ),
            (
                AlterClusterOption::Set {
                    name: SealOptionName::Unsealed,
                    value: None,
                },
                false,
            ),
            (
                AlterClusterOption::Set {
                    name: SealOptionName::Unsealed,
                    value: Some(false),
                },
                true,
            ),
            (AlterClusterOption::Reset(SealOptionName::Sealed), false),
        ];
        for (option, sealed) in cases {
            assert_eq!(
                SealRequest::from_option(option),
                SealRequest { sealed },
                "{option:?}"
            );
        }
    }
}
