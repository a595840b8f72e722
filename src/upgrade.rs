// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Leader-gated upgrade of the shared cluster state.
//!
//! Every control-plane replica calls [`upgrade`] on start. Each one first runs
//! its local node steps, which touch only the replica's own host, and then all
//! of them compete for the upgrade lease; the winner resolves the CRD API version and then
//! runs the migration chain, the others wait. Once the run ends the lease is
//! released and the next replica in line repeats the run, which finds nothing
//! left to do because every step is idempotent.
//!
//! A run moves through these states:
//!
//! ```text
//! Start -> VersionResolved -> CrUpgraded -> PodsUpgraded
//!       -> ServicesUpgraded -> WorkloadsUpgraded -> Done
//! ```
//!
//! Any error moves the run to `Failed` and aborts it; the steps that already
//! completed are not rolled back.

pub mod chain;
pub mod steps;
pub mod version;

pub use chain::{FnStep, MigrationChain, MigrationStep, StepFuture};
pub use version::{resolve_api_version, InstallProbe, LegacyConversion, VersionResolution};

use crate::constants::UPGRADE_LEASE_NAME;
use crate::context::Context;
use crate::election::{KubeLeaseLock, LeaderElector, LeaderEvent, LeaderState, Leadership, LeaseConfig};
use crate::errors::{Phase, UpgradeError};
use crate::metrics::{record_phase_duration, record_upgrade_run};
use crate::version_store::{ApiVersionPolicy, VersionStore};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Progress of an upgrade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Nothing done yet
    Start,
    /// API version settled
    VersionResolved,
    /// Custom resource steps done
    CrUpgraded,
    /// Pod steps done
    PodsUpgraded,
    /// Service steps done
    ServicesUpgraded,
    /// Workload steps done
    WorkloadsUpgraded,
    /// Run finished successfully
    Done,
    /// Run aborted
    Failed,
}

impl UpgradeState {
    /// State reached once every step of `phase` has completed.
    #[must_use]
    pub const fn after(phase: Phase) -> Self {
        match phase {
            // Runs before a leader run exists
            Phase::LocalNode => UpgradeState::Start,
            Phase::ApiVersion => UpgradeState::VersionResolved,
            Phase::CustomResources => UpgradeState::CrUpgraded,
            Phase::Pods => UpgradeState::PodsUpgraded,
            Phase::Services => UpgradeState::ServicesUpgraded,
            Phase::Workloads => UpgradeState::WorkloadsUpgraded,
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Record of one upgrade run on the leader. Kept in memory only.
#[derive(Debug, Clone)]
pub struct UpgradeRun {
    /// Identity of the replica running it
    pub leader: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Where the run is
    pub state: UpgradeState,
    /// Outcome of the API version phase, once known
    pub resolution: Option<VersionResolution>,
    /// Names of the steps that completed, in order
    pub completed_steps: Vec<String>,
}

impl UpgradeRun {
    /// A run that has not started yet.
    pub fn new(leader: impl Into<String>) -> Self {
        Self {
            leader: leader.into(),
            started_at: Utc::now(),
            state: UpgradeState::Start,
            resolution: None,
            completed_steps: Vec::new(),
        }
    }
}

/// Version resolution plus the migration chain, without the election around it.
pub struct Upgrader {
    policy: ApiVersionPolicy,
    store: Arc<dyn VersionStore>,
    probe: Arc<dyn InstallProbe>,
    conversions: Vec<Arc<dyn LegacyConversion>>,
    chain: MigrationChain,
}

impl Upgrader {
    /// An upgrader with no conversions and an empty chain.
    pub fn new(
        policy: ApiVersionPolicy,
        store: Arc<dyn VersionStore>,
        probe: Arc<dyn InstallProbe>,
    ) -> Self {
        Self {
            policy,
            store,
            probe,
            conversions: Vec::new(),
            chain: MigrationChain::new(),
        }
    }

    /// Register the conversion for one legacy API version.
    #[must_use]
    pub fn with_conversion(mut self, conversion: Arc<dyn LegacyConversion>) -> Self {
        self.conversions.push(conversion);
        self
    }

    /// Use `chain` for the phases after version resolution.
    #[must_use]
    pub fn with_chain(mut self, chain: MigrationChain) -> Self {
        self.chain = chain;
        self
    }

    /// Registered migration chain.
    pub fn chain(&self) -> &MigrationChain {
        &self.chain
    }

    /// Run every phase in order, stopping at the first failure.
    ///
    /// `leadership` is checked before each step; a step that already started
    /// always runs to completion.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Phase`] for the first failing phase, or
    /// [`UpgradeError::LeadershipLost`] if this replica stopped leading.
    pub async fn execute(
        &self,
        run: &mut UpgradeRun,
        leadership: &Leadership,
    ) -> Result<(), UpgradeError> {
        info!(leader = %run.leader, "Start upgrading");

        match self.run_phases(run, leadership).await {
            Ok(()) => {
                run.state = UpgradeState::Done;
                record_upgrade_run("success");
                info!(
                    steps = run.completed_steps.len(),
                    resolution = ?run.resolution,
                    "Finish upgrading"
                );
                Ok(())
            }
            Err(e) => {
                let reached = run.state;
                run.state = UpgradeState::Failed;
                record_upgrade_run("failure");
                error!(state = %reached, "Upgrade failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        run: &mut UpgradeRun,
        leadership: &Leadership,
    ) -> Result<(), UpgradeError> {
        ensure_leading(leadership, run)?;
        let started = Instant::now();
        let resolution = resolve_api_version(
            &self.policy,
            self.store.as_ref(),
            self.probe.as_ref(),
            &self.conversions,
        )
        .await
        .map_err(|e| UpgradeError::phase(Phase::ApiVersion, e))?;
        record_phase_duration(Phase::ApiVersion.as_str(), started.elapsed());
        debug!(%resolution, "Resolved CRD API version");
        run.resolution = Some(resolution);
        run.state = UpgradeState::after(Phase::ApiVersion);

        for phase in Phase::CHAIN {
            let started = Instant::now();
            for step in self.chain.steps(phase) {
                ensure_leading(leadership, run)?;
                debug!(%phase, step = step.name(), "Running migration step");
                step.apply()
                    .await
                    .with_context(|| format!("step {}", step.name()))
                    .map_err(|e| UpgradeError::phase(phase, e))?;
                run.completed_steps.push(step.name().to_string());
            }
            record_phase_duration(phase.as_str(), started.elapsed());
            run.state = UpgradeState::after(phase);
        }

        Ok(())
    }
}

fn ensure_leading(leadership: &Leadership, run: &UpgradeRun) -> Result<(), UpgradeError> {
    if *leadership.borrow() == LeaderState::Leading {
        return Ok(());
    }
    Err(UpgradeError::LeadershipLost {
        completed: run.completed_steps.len(),
    })
}

/// Runs an [`Upgrader`] once this replica wins the upgrade lease.
pub struct UpgradeCoordinator {
    elector: LeaderElector,
    upgrader: Upgrader,
    local_steps: Vec<Box<dyn MigrationStep>>,
}

impl UpgradeCoordinator {
    /// Pair a candidate with the work it guards.
    pub fn new(elector: LeaderElector, upgrader: Upgrader) -> Self {
        Self {
            elector,
            upgrader,
            local_steps: Vec::new(),
        }
    }

    /// Register a step that every replica runs on its own node before the
    /// election. Steps run in registration order.
    #[must_use]
    pub fn with_local_step(mut self, step: impl MigrationStep + 'static) -> Self {
        self.local_steps.push(Box::new(step));
        self
    }

    /// Run the local node steps, then wait for leadership, run the upgrade and
    /// release the lease.
    ///
    /// Blocks for as long as another replica holds the lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Phase`] for [`Phase::LocalNode`] if a local
    /// step fails, in which case the lease is never touched.
    /// Returns [`UpgradeError::ElectionEnded`] if the election stops before
    /// this replica is elected, or the error of the upgrade run.
    pub async fn run(self) -> Result<UpgradeRun, UpgradeError> {
        self.upgrade_local_node().await?;

        let identity = self.elector.identity().to_string();
        let (handle, mut events) = self.elector.spawn();

        loop {
            match events.recv().await {
                Some(LeaderEvent::Elected) => break,
                Some(LeaderEvent::NewLeader(holder)) => {
                    if holder != identity {
                        info!("New upgrade leader elected: {}", holder);
                    }
                }
                Some(LeaderEvent::Deposed) => {}
                None => return Err(UpgradeError::ElectionEnded),
            }
        }

        let mut run = UpgradeRun::new(&identity);
        let result = self
            .upgrader
            .execute(&mut run, &handle.leadership())
            .await;

        handle.shutdown().await;
        info!("Upgrade leader lost: {}", identity);

        result.map(|()| run)
    }

    async fn upgrade_local_node(&self) -> Result<(), UpgradeError> {
        let started = Instant::now();
        for step in &self.local_steps {
            debug!(step = step.name(), "Running local node step");
            step.apply()
                .await
                .with_context(|| format!("step {}", step.name()))
                .map_err(|e| UpgradeError::phase(Phase::LocalNode, e))?;
        }
        if !self.local_steps.is_empty() {
            record_phase_duration(Phase::LocalNode.as_str(), started.elapsed());
            info!(steps = self.local_steps.len(), "Local node upgraded");
        }
        Ok(())
    }
}

/// Upgrade the cluster state as replica `node_id`.
///
/// Builds the Kubernetes client, competes for the upgrade lease in the pod
/// namespace and runs the production migration chain once elected.
///
/// # Errors
///
/// Returns [`UpgradeError::Bootstrap`] if the client or the election cannot
/// be set up, otherwise whatever [`UpgradeCoordinator::run`] returns.
pub async fn upgrade(kubeconfig: Option<&Path>, node_id: &str) -> Result<UpgradeRun, UpgradeError> {
    let ctx = Context::new(kubeconfig)
        .await
        .map_err(|e| UpgradeError::bootstrap("failed to set up upgrade context", e))?;

    let lock = Arc::new(KubeLeaseLock::new(
        ctx.client.clone(),
        &ctx.namespace,
        UPGRADE_LEASE_NAME,
    ));
    let elector = LeaderElector::new(lock, node_id, LeaseConfig::default())
        .map_err(|e| UpgradeError::bootstrap("failed to set up upgrade leader election", e))?;

    UpgradeCoordinator::new(elector, steps::production_upgrader(&ctx))
        .run()
        .await
}

#[cfg(test)]
#[path = "upgrade_tests.rs"]
mod upgrade_tests;
