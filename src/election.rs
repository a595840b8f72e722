// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Lease-based leader election.
//!
//! Every replica runs one [`LeaderElector`]. Its background task moves through
//! three states:
//!
//! ```text
//! NotLeading --acquired--> Leading --renewal failed or shutdown--> Deposed
//! ```
//!
//! A candidate only takes the lease when nobody holds it, when it already holds
//! it, or when the record has not changed for a full lease duration as seen
//! from this process. The clock that matters is the local one: remote
//! timestamps in the record are written but never trusted for expiry.
//!
//! Transitions are reported as [`LeaderEvent`]s on a channel, and the current
//! state is published on a [`Leadership`] watch so long-running work can check
//! it between steps.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storage_upgrade::election::{LeaderElector, LeaderEvent, LeaseConfig, MemoryLeaseLock};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let lock = Arc::new(MemoryLeaseLock::new("upgrade-lock"));
//! let elector = LeaderElector::new(lock, "node-a", LeaseConfig::default())?;
//! let (handle, mut events) = elector.spawn();
//!
//! while let Some(event) = events.recv().await {
//!     if event == LeaderEvent::Elected {
//!         // do the work, then let go of the lease
//!         handle.shutdown().await;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod kube_lock;
mod lock;

pub use kube_lock::KubeLeaseLock;
pub use lock::{LeaseConfig, LeaseLock, LeaseRecord, MemoryLeaseLock, VersionedRecord};

use crate::constants::RELEASED_LEASE_DURATION_SECS;
use crate::metrics::{record_leader_elected, record_leader_lost, record_leader_released};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Notifications emitted by the elector task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderEvent {
    /// This candidate acquired the lease
    Elected,
    /// This candidate stopped leading (renewal failed or shutdown)
    Deposed,
    /// The observed holder changed; may be this candidate
    NewLeader(String),
}

/// Where a candidate is in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Waiting for the lease
    NotLeading,
    /// Holding the lease
    Leading,
    /// Held the lease and lost it; terminal
    Deposed,
}

/// Read side of a candidate's state.
pub type Leadership = watch::Receiver<LeaderState>;

/// A candidate for the lease, before its task is started.
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: LeaseConfig,
}

impl LeaderElector {
    /// Create a candidate called `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is empty or the timing is inconsistent.
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: impl Into<String>,
        config: LeaseConfig,
    ) -> anyhow::Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            anyhow::bail!("leader election identity must not be empty");
        }
        config.validate()?;
        Ok(Self {
            lock,
            identity,
            config,
        })
    }

    /// Identity this candidate competes as.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Start competing for the lease.
    ///
    /// The event channel closes when the elector task ends: after deposition,
    /// or after shutdown.
    pub fn spawn(self) -> (ElectionHandle, mpsc::UnboundedReceiver<LeaderEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LeaderState::NotLeading);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            identity = %self.identity,
            lease = %self.lock.describe(),
            "Starting leader election"
        );

        let candidate = Candidate {
            lock: self.lock,
            identity: self.identity,
            config: self.config,
            observed: None,
            reported_leader: None,
            events: events_tx,
            state: state_tx,
        };
        let task = tokio::spawn(candidate.run(shutdown_rx));

        (
            ElectionHandle {
                shutdown: shutdown_tx,
                state: state_rx,
                task: Some(task),
            },
            events_rx,
        )
    }
}

/// Control over a running elector task.
///
/// Dropping the handle asks the task to stop; with `release_on_cancel` the
/// lease is released as part of stopping.
pub struct ElectionHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LeaderState>,
    task: Option<JoinHandle<()>>,
}

impl ElectionHandle {
    /// A receiver that follows this candidate's state.
    pub fn leadership(&self) -> Leadership {
        self.state.clone()
    }

    /// Returns true while this candidate holds the lease.
    pub fn is_leader(&self) -> bool {
        *self.state.borrow() == LeaderState::Leading
    }

    /// Stop the elector and wait for it to finish, releasing the lease if configured.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Leader election task ended abnormally: {}", e);
            }
        }
    }

    /// Kill the elector without releasing the lease.
    ///
    /// Other candidates have to wait for the lease to expire, exactly as if
    /// this process had crashed.
    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shutdown.send(true);
        }
    }
}

/// What this process last saw in the lease, and when it saw it change.
struct Observed {
    record: LeaseRecord,
    resource_version: String,
    at: Instant,
}

struct Candidate {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: LeaseConfig,
    observed: Option<Observed>,
    reported_leader: Option<String>,
    events: mpsc::UnboundedSender<LeaderEvent>,
    state: watch::Sender<LeaderState>,
}

/// Sleep for one retry period; returns false if shutdown was requested meanwhile.
async fn wait_retry(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        () = sleep(period) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

impl Candidate {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // Acquire
        loop {
            if *shutdown.borrow() {
                debug!(identity = %self.identity, "Leader election stopped before acquiring");
                return;
            }
            if self.try_acquire_or_renew().await {
                break;
            }
            if !wait_retry(&mut shutdown, self.config.retry_period).await {
                debug!(identity = %self.identity, "Leader election stopped before acquiring");
                return;
            }
        }

        info!(identity = %self.identity, "Successfully acquired lease {}", self.lock.describe());
        record_leader_elected(&self.identity);
        self.state.send_replace(LeaderState::Leading);
        self.emit(LeaderEvent::Elected);

        // Renew
        let mut last_renewed = Instant::now();
        loop {
            if !wait_retry(&mut shutdown, self.config.retry_period).await {
                if self.config.release_on_cancel {
                    self.release().await;
                }
                self.step_down();
                return;
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewed.elapsed());
            let renewed = matches!(
                timeout(remaining.max(Duration::from_millis(1)), self.try_acquire_or_renew()).await,
                Ok(true)
            );

            if renewed {
                last_renewed = Instant::now();
            } else if last_renewed.elapsed() >= self.config.renew_deadline {
                warn!(
                    identity = %self.identity,
                    "Failed to renew lease {} within {:?}",
                    self.lock.describe(),
                    self.config.renew_deadline
                );
                record_leader_lost(&self.identity);
                self.step_down();
                return;
            }
        }
    }

    fn step_down(&self) {
        self.state.send_replace(LeaderState::Deposed);
        self.emit(LeaderEvent::Deposed);
    }

    fn emit(&self, event: LeaderEvent) {
        // Nobody listening is fine; the state watch still reflects reality
        let _ = self.events.send(event);
    }

    fn observe(&mut self, record: LeaseRecord, resource_version: String) {
        let changed = self.observed.as_ref().map_or(true, |o| {
            o.record != record || o.resource_version != resource_version
        });
        if changed {
            self.observed = Some(Observed {
                record,
                resource_version,
                at: Instant::now(),
            });
        }
    }

    fn report_leader(&mut self, holder: Option<&str>) {
        let Some(holder) = holder else {
            return;
        };
        if self.reported_leader.as_deref() != Some(holder) {
            self.reported_leader = Some(holder.to_string());
            self.emit(LeaderEvent::NewLeader(holder.to_string()));
        }
    }

    /// One acquire-or-renew round; returns true if this candidate holds the lease afterwards.
    async fn try_acquire_or_renew(&mut self) -> bool {
        let now = Utc::now();
        let mut desired = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        };

        let current = match self.lock.get().await {
            Ok(current) => current,
            Err(e) => {
                warn!(identity = %self.identity, "Error retrieving lease {}: {}", self.lock.describe(), e);
                return false;
            }
        };

        let Some(current) = current else {
            return match self.lock.create(&desired).await {
                Ok(version) => {
                    self.observe(desired, version);
                    self.report_leader(Some(&self.identity.clone()));
                    true
                }
                Err(e) => {
                    debug!(identity = %self.identity, "Error creating lease: {}", e);
                    false
                }
            };
        };

        self.observe(current.record.clone(), current.resource_version.clone());
        self.report_leader(current.record.holder());

        let holder = current.record.holder();
        let held_by_self = holder == Some(self.identity.as_str());
        if let (Some(holder), false) = (holder, held_by_self) {
            let observed_at = self.observed.as_ref().map_or_else(Instant::now, |o| o.at);
            if observed_at + current.record.lease_duration > Instant::now() {
                debug!(
                    identity = %self.identity,
                    "Lease is held by {} and has not yet expired",
                    holder
                );
                return false;
            }
        }

        if held_by_self {
            desired.acquire_time = current.record.acquire_time;
            desired.lease_transitions = current.record.lease_transitions;
        } else {
            desired.lease_transitions = current.record.lease_transitions + 1;
        }

        match self.lock.update(&desired, &current.resource_version).await {
            Ok(version) => {
                self.observe(desired, version);
                self.report_leader(Some(&self.identity.clone()));
                true
            }
            Err(e) => {
                debug!(identity = %self.identity, "Failed to update lease: {}", e);
                false
            }
        }
    }

    /// Hand the lease back so another candidate can take it without waiting for expiry.
    async fn release(&mut self) {
        let Some((resource_version, lease_transitions)) = self
            .observed
            .as_ref()
            .filter(|o| o.record.holder() == Some(self.identity.as_str()))
            .map(|o| (o.resource_version.clone(), o.record.lease_transitions))
        else {
            return;
        };

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: Duration::from_secs(RELEASED_LEASE_DURATION_SECS),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions,
        };

        match self.lock.update(&released, &resource_version).await {
            Ok(version) => {
                info!(identity = %self.identity, "Released lease {}", self.lock.describe());
                record_leader_released(&self.identity);
                self.observe(released, version);
            }
            Err(e) => warn!(identity = %self.identity, "Failed to release lease: {}", e),
        }
    }
}

#[cfg(test)]
#[path = "election_tests.rs"]
mod election_tests;
