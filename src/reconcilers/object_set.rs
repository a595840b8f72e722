// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Ordered deploy and best-effort cleanup of a group of managed objects.
//!
//! A logical unit such as a CSI sidecar (service + deployment) is installed and
//! removed as an [`ObjectSet`]:
//!
//! - [`ObjectSet::deploy`] walks the objects in order and stops at the first
//!   error. Objects created before the failure stay in place because later
//!   objects may depend on them (a deployment referencing a service name).
//! - [`ObjectSet::cleanup`] deletes every object concurrently, waits for all of
//!   them, and only logs individual failures.

use crate::errors::ObjectError;
use crate::metrics::record_cleanup_failure;
use crate::reconcilers::resources::{cleanup, deploy, ManagedObject};
use futures::future::join_all;
use tracing::{debug, warn};

/// Outcome of a best-effort cleanup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Objects that are gone (deleted now or already absent), as `Kind/name`
    pub removed: Vec<String>,
    /// Objects that could not be removed, as `Kind/name`
    pub failed: Vec<String>,
}

impl CleanupReport {
    /// True when every object was removed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A named, ordered group of managed objects.
pub struct ObjectSet {
    name: String,
    objects: Vec<Box<dyn ManagedObject>>,
}

impl ObjectSet {
    /// Create an empty set; `name` is used in log messages (e.g., "attacher deployment").
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
        }
    }

    /// Append an object; deploy order follows insertion order.
    #[must_use]
    pub fn with(mut self, object: impl ManagedObject + 'static) -> Self {
        self.objects.push(Box::new(object));
        self
    }

    /// Append an already boxed object.
    pub fn push(&mut self, object: Box<dyn ManagedObject>) {
        self.objects.push(object);
    }

    /// Name of the set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of objects in the set.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the set holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Deploy every object in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered. Objects deployed before it are left in place.
    pub async fn deploy(&self) -> Result<(), ObjectError> {
        for object in &self.objects {
            deploy(object.as_ref()).await?;
        }
        debug!(set = %self.name, objects = self.objects.len(), "Deployed object set");
        Ok(())
    }

    /// Remove every object concurrently; never fails.
    ///
    /// All deletions are awaited before returning. Failures are logged and
    /// reported in the returned [`CleanupReport`].
    pub async fn cleanup(&self) -> CleanupReport {
        let outcomes = join_all(self.objects.iter().map(|object| async move {
            let label = format!("{}/{}", object.kind(), object.name());
            (label, cleanup(object.as_ref()).await)
        }))
        .await;

        let mut report = CleanupReport::default();
        for ((label, outcome), object) in outcomes.into_iter().zip(&self.objects) {
            match outcome {
                Ok(()) => report.removed.push(label),
                Err(e) => {
                    warn!("Failed to cleanup {} in {}: {}", label, self.name, e);
                    record_cleanup_failure(object.kind());
                    report.failed.push(label);
                }
            }
        }
        report
    }
}

#[cfg(test)]
#[path = "object_set_tests.rs"]
mod object_set_tests;
