// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common test utilities for scenario and integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, PostParams};
use kube::client::Client;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage_upgrade::upgrade::{InstallProbe, LegacyConversion, MigrationChain, MigrationStep};
use tokio::sync::Notify;

// ============================================================================
// In-memory cluster
// ============================================================================

/// Shared state every replica migrates, standing in for the API server
#[derive(Default)]
pub struct FakeCluster {
    /// Keys whose migration has been applied
    applied: Mutex<BTreeSet<String>>,
    /// Every change made, as `replica:key`, in order
    changes: Mutex<Vec<String>>,
    /// Steps currently executing
    active: AtomicUsize,
    /// Highest number of steps seen executing at once
    max_active: AtomicUsize,
    /// Conversions performed
    conversions: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply `key` once; returns false if it was already applied.
    fn apply(&self, replica: &str, key: &str) -> bool {
        let inserted = self.applied.lock().unwrap().insert(key.to_string());
        if inserted {
            self.changes.lock().unwrap().push(format!("{replica}:{key}"));
        }
        inserted
    }

    pub fn changes(&self) -> Vec<String> {
        self.changes.lock().unwrap().clone()
    }

    pub fn is_applied(&self, key: &str) -> bool {
        self.applied.lock().unwrap().contains(key)
    }

    pub fn max_concurrent_steps(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Idempotent step: applies its key to the cluster unless already applied
pub struct ClusterStep {
    name: String,
    replica: String,
    cluster: Arc<FakeCluster>,
}

impl ClusterStep {
    pub fn new(name: &str, replica: &str, cluster: &Arc<FakeCluster>) -> Self {
        Self {
            name: name.to_string(),
            replica: replica.to_string(),
            cluster: cluster.clone(),
        }
    }
}

#[async_trait]
impl MigrationStep for ClusterStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self) -> Result<()> {
        self.cluster.enter();
        // Simulated API latency
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.cluster.apply(&self.replica, &self.name);
        self.cluster.leave();
        Ok(())
    }
}

/// Step that never finishes; used to freeze a replica mid-chain
pub struct StuckStep {
    pub entered: Arc<Notify>,
}

#[async_trait]
impl MigrationStep for StuckStep {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn apply(&self) -> Result<()> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// The chain every replica runs: one step per phase
pub fn cluster_chain(replica: &str, cluster: &Arc<FakeCluster>) -> MigrationChain {
    MigrationChain::new()
        .with_custom_resource_step(ClusterStep::new("settings", replica, cluster))
        .with_pod_step(ClusterStep::new("pods", replica, cluster))
        .with_service_step(ClusterStep::new("services", replica, cluster))
        .with_workload_step(ClusterStep::new("workloads", replica, cluster))
}

/// Probe with a fixed answer
pub struct FixedProbe(pub bool);

#[async_trait]
impl InstallProbe for FixedProbe {
    async fn can_upgrade(&self) -> Result<bool> {
        Ok(self.0)
    }
}

/// Conversion from `v1` that records itself on the cluster
pub struct ClusterConversion {
    pub cluster: Arc<FakeCluster>,
}

#[async_trait]
impl LegacyConversion for ClusterConversion {
    fn from_version(&self) -> &str {
        "v1"
    }

    async fn convert(&self) -> Result<()> {
        self.cluster.conversions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Real cluster helpers
// ============================================================================

/// Get a Kubernetes client or skip the test if not in a cluster
pub async fn get_kube_client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test: not running in Kubernetes cluster: {e}");
            None
        }
    }
}

/// Create a test namespace
pub async fn create_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let ns = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": {
                "test": "integration",
                "managed-by": "storage-upgrade-test"
            }
        }
    }))?;

    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            println!("Created test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            println!("Test namespace already exists: {name}");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

/// Cleanup test namespace
pub async fn cleanup_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    match namespaces.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            println!("Deleted test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}
