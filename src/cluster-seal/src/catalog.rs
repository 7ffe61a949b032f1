// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable state of sealed clusters.
//!
//! A cluster's record holds its configuration and, once sealed, the merged
//! plan and residency decisions, so that a restarted cluster resumes running
//! the plan it was sealed with instead of re-optimizing.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::budget::ResidencyPlan;
use crate::cse::{MergedNode, MergedPlan};
use crate::error::CatalogError;
use crate::id::{ClusterId, GlobalId};
use crate::state::{upgrade_legacy_config, ClusterConfig, LegacyClusterConfig};

/// The durable record of a cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DurableClusterRecord {
    pub name: String,
    pub config: ClusterConfig,
    /// The plan the cluster was sealed with. Absent while unsealed.
    #[serde(default)]
    pub plan: Option<DurablePlan>,
}

impl DurableClusterRecord {
    pub fn encode(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a record. Records written before clusters could be sealed are
    /// upgraded to unsealed records.
    pub fn decode(raw: &str) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let legacy = value
            .get("config")
            .is_some_and(|config| config.get("sealed").is_none());
        if legacy {
            let record: LegacyClusterRecord = serde_json::from_value(value)?;
            return Ok(DurableClusterRecord {
                name: record.name,
                config: upgrade_legacy_config(record.config),
                plan: None,
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// A cluster record as written before clusters could be sealed.
#[derive(Deserialize)]
struct LegacyClusterRecord {
    name: String,
    config: LegacyClusterConfig,
}

/// The persisted form of a merged plan and its residency.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DurablePlan {
    pub nodes: Vec<MergedNode>,
    /// `(dataflow, root slot)` pairs. JSON object keys must be strings, so
    /// roots are stored as a list.
    pub roots: Vec<(GlobalId, usize)>,
    pub residency: ResidencyPlan,
}

impl DurablePlan {
    pub fn new(plan: &MergedPlan, residency: &ResidencyPlan) -> Self {
        DurablePlan {
            nodes: plan.nodes.clone(),
            roots: plan.roots.iter().map(|(id, root)| (*id, *root)).collect(),
            residency: residency.clone(),
        }
    }

    pub fn into_parts(self) -> (MergedPlan, ResidencyPlan) {
        let plan = MergedPlan {
            nodes: self.nodes,
            roots: self.roots.into_iter().collect(),
        };
        (plan, self.residency)
    }
}

/// Durable storage of cluster records.
#[async_trait]
pub trait SealCatalog: Debug + Send + Sync {
    async fn load_cluster(&self, id: ClusterId) -> Result<DurableClusterRecord, CatalogError>;

    /// Atomically replaces the record of cluster `id`.
    async fn commit_cluster(
        &self,
        id: ClusterId,
        record: &DurableClusterRecord,
    ) -> Result<(), CatalogError>;
}

/// A [`SealCatalog`] that keeps encoded records in memory.
#[derive(Debug, Default)]
pub struct MemCatalog {
    records: Mutex<BTreeMap<ClusterId, String>>,
    fail_next_commit: AtomicBool,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail without writing anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// The encoded record of cluster `id`.
    pub fn raw(&self, id: ClusterId) -> Option<String> {
        self.records.lock().expect("lock poisoned").get(&id).cloned()
    }

    /// Stores an already encoded record, as written by an older version.
    pub fn insert_raw(&self, id: ClusterId, raw: impl Into<String>) {
        self.records
            .lock()
            .expect("lock poisoned")
            .insert(id, raw.into());
    }
}

#[async_trait]
impl SealCatalog for MemCatalog {
    async fn load_cluster(&self, id: ClusterId) -> Result<DurableClusterRecord, CatalogError> {
        let raw = self.raw(id).ok_or(CatalogError::ClusterMissing(id))?;
        DurableClusterRecord::decode(&raw)
    }

    async fn commit_cluster(
        &self,
        id: ClusterId,
        record: &DurableClusterRecord,
    ) -> Result<(), CatalogError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(CatalogError::Storage(anyhow!(
                "durable store unavailable while committing cluster {id}"
            )));
        }
        let raw = record.encode()?;
        self.insert_raw(id, raw);
        Ok(())
    }
}
