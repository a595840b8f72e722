// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Lease records and the storage they live in.

use crate::constants::{
    UPGRADE_LEASE_DURATION_SECS, UPGRADE_LEASE_RENEW_DEADLINE_SECS,
    UPGRADE_LEASE_RETRY_PERIOD_SECS,
};
use crate::errors::LeaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Contents of the shared lease.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseRecord {
    /// Identity of the current holder; `None` or empty when released
    pub holder_identity: Option<String>,
    /// How long the holder may go without renewing
    pub lease_duration: Duration,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of times the lease changed hands
    pub lease_transitions: i32,
}

impl LeaseRecord {
    /// Current holder, treating an empty identity as no holder.
    #[must_use]
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }
}

/// A lease record together with the storage version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// The record
    pub record: LeaseRecord,
    /// Opaque version used for compare-and-swap updates
    pub resource_version: String,
}

/// Timing of the election.
///
/// `lease_duration` must exceed `renew_deadline`, which must exceed `retry_period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long non-leaders wait after the last observed change before taking over
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a failed renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
    /// Clear the holder when the elector shuts down cleanly
    pub release_on_cancel: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(UPGRADE_LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(UPGRADE_LEASE_RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(UPGRADE_LEASE_RETRY_PERIOD_SECS),
            release_on_cancel: true,
        }
    }
}

impl LeaseConfig {
    /// Check the timing relationships.
    ///
    /// # Errors
    ///
    /// Returns an error if the durations are zero or out of order.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_period.is_zero() {
            anyhow::bail!("retry period must be greater than zero");
        }
        if self.lease_duration <= self.renew_deadline {
            anyhow::bail!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration,
                self.renew_deadline
            );
        }
        if self.renew_deadline <= self.retry_period {
            anyhow::bail!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline,
                self.retry_period
            );
        }
        Ok(())
    }
}

/// Storage for a single lease record with compare-and-swap updates.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Human readable location of the lease, for logs.
    fn describe(&self) -> String;

    /// Read the lease; `None` if it has never been created.
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError>;

    /// Create the lease and return its new version.
    ///
    /// Fails with [`LeaseError::AlreadyExists`] if another candidate created it first.
    async fn create(&self, record: &LeaseRecord) -> Result<String, LeaseError>;

    /// Replace the lease if it is still at `resource_version`, returning the new version.
    ///
    /// Fails with [`LeaseError::Conflict`] if the lease changed since it was read.
    async fn update(&self, record: &LeaseRecord, resource_version: &str)
        -> Result<String, LeaseError>;
}

/// Process-local lease, shared between candidates through an `Arc`.
#[derive(Debug)]
pub struct MemoryLeaseLock {
    name: String,
    slot: Mutex<Option<(LeaseRecord, u64)>>,
}

impl MemoryLeaseLock {
    /// Create an empty lease called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(None),
        }
    }

    /// Snapshot of the stored record.
    pub fn record(&self) -> Option<LeaseRecord> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(record, _)| record.clone()))
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.record().and_then(|r| r.holder().map(str::to_string))
    }

    fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<(LeaseRecord, u64)>>, LeaseError> {
        self.slot.lock().map_err(|_| LeaseError::Backend {
            name: self.name.clone(),
            source: anyhow::anyhow!("lease mutex poisoned"),
        })
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }

    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
        let slot = self.lock_slot()?;
        Ok(slot.as_ref().map(|(record, version)| VersionedRecord {
            record: record.clone(),
            resource_version: version.to_string(),
        }))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<String, LeaseError> {
        let mut slot = self.lock_slot()?;
        if slot.is_some() {
            return Err(LeaseError::AlreadyExists {
                name: self.name.clone(),
            });
        }
        *slot = Some((record.clone(), 1));
        Ok("1".to_string())
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        resource_version: &str,
    ) -> Result<String, LeaseError> {
        let mut slot = self.lock_slot()?;
        match slot.as_mut() {
            Some((stored, version)) if version.to_string() == resource_version => {
                *stored = record.clone();
                *version += 1;
                Ok(version.to_string())
            }
            _ => Err(LeaseError::Conflict {
                name: self.name.clone(),
            }),
        }
    }
}
