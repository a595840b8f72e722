// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for the upgrade coordinator.
//!
//! This module provides specialized error types for:
//! - Reconciling managed cluster objects (create/get/delete races)
//! - Leader election lease operations
//! - CRD API version resolution
//! - The upgrade run as a whole, tagged with the phase that failed
//!
//! Step-internal causes are carried as [`anyhow::Error`] so every layer can add
//! context, while callers still get a structured phase tag to match on.

use std::fmt;
use thiserror::Error;

/// Phases of an upgrade run, in execution order.
///
/// The local node phase runs on every replica before the election. The API
/// version phase is the first leader-only phase and is driven by the version
/// resolution logic rather than by registered steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Per-replica steps run before competing for the lease
    LocalNode,
    /// CRD API version resolution and legacy conversion
    ApiVersion,
    /// Per-version custom resource upgraders
    CustomResources,
    /// Pod-level upgraders
    Pods,
    /// Service upgraders
    Services,
    /// Deployment and daemon set upgraders
    Workloads,
}

impl Phase {
    /// Phases that execute registered migration steps, in order.
    pub const CHAIN: [Phase; 4] = [
        Phase::CustomResources,
        Phase::Pods,
        Phase::Services,
        Phase::Workloads,
    ];

    /// Short, metrics-safe name of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::LocalNode => "local_node",
            Phase::ApiVersion => "api_version",
            Phase::CustomResources => "custom_resources",
            Phase::Pods => "pods",
            Phase::Services => "services",
            Phase::Workloads => "workloads",
        }
    }

    /// Context prefix used when a step in this phase fails.
    #[must_use]
    pub const fn failure_context(self) -> &'static str {
        match self {
            Phase::LocalNode => "upgrade local node failed",
            Phase::ApiVersion => "upgrade API version failed",
            Phase::CustomResources => "upgrade custom resources failed",
            Phase::Pods => "upgrade pods failed",
            Phase::Services => "upgrade services failed",
            Phase::Workloads => "upgrade workloads failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a single managed object operation.
///
/// `AlreadyExists` and `NotFound` are races with another actor; the reconciler
/// turns them into success depending on direction.
#[derive(Error, Debug)]
pub enum ObjectError {
    /// The object was created by someone else between `get` and `create`
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Object kind (e.g., `Service`)
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// The object disappeared between `get` and `delete`
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Object kind (e.g., `Deployment`)
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// Any other failure talking to the cluster
    #[error("failed to {operation} {kind} {namespace}/{name}: {source}")]
    Api {
        /// Operation that failed (`get`, `create` or `delete`)
        operation: &'static str,
        /// Object kind
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },
}

impl ObjectError {
    /// Returns true if this error reports a create race.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, ObjectError::AlreadyExists { .. })
    }

    /// Returns true if this error reports a delete race.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, ObjectError::NotFound { .. })
    }
}

/// Errors raised by a lease backend.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another candidate created the lease first
    #[error("lease {name} already exists")]
    AlreadyExists {
        /// Lease name
        name: String,
    },

    /// The lease changed since it was read
    #[error("lease {name} was modified concurrently")]
    Conflict {
        /// Lease name
        name: String,
    },

    /// The stored lease could not be interpreted
    #[error("lease {name} is malformed: {reason}")]
    Malformed {
        /// Lease name
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Transport or API failure
    #[error("lease request for {name} failed: {source}")]
    Backend {
        /// Lease name
        name: String,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },
}

/// Errors resolving the persisted CRD API version.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The marker holds a tag this release has never heard of
    #[error("unrecognized CRD API version {0}")]
    Unrecognized(String),

    /// The marker holds a known tag that has no conversion path
    #[error("don't support upgrade from {from} to {to}")]
    Unsupported {
        /// Tag found in the cluster
        from: String,
        /// Tag this release writes
        to: String,
    },
}

/// Terminal errors of an upgrade run.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// Client or configuration could not be built; no leadership was attempted
    #[error("{context}: {source}")]
    Bootstrap {
        /// What was being set up
        context: String,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },

    /// A phase failed; the run was aborted at the first error
    #[error("{}: {:#}", .phase.failure_context(), .source)]
    Phase {
        /// Phase that failed
        phase: Phase,
        /// Underlying cause, including the step name
        #[source]
        source: anyhow::Error,
    },

    /// Leadership was lost between steps; the remaining steps were skipped
    #[error("upgrade leadership lost after {completed} completed step(s)")]
    LeadershipLost {
        /// Number of steps that completed before the loss was noticed
        completed: usize,
    },

    /// The election loop stopped before this replica was ever elected
    #[error("leader election ended before this replica was elected")]
    ElectionEnded,
}

impl UpgradeError {
    /// Wrap a cause with the phase it happened in.
    pub fn phase(phase: Phase, source: impl Into<anyhow::Error>) -> Self {
        UpgradeError::Phase {
            phase,
            source: source.into(),
        }
    }

    /// Wrap a cause as a bootstrap failure.
    pub fn bootstrap(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        UpgradeError::Bootstrap {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Phase that failed, if the error came from a phase.
    #[must_use]
    pub const fn failed_phase(&self) -> Option<Phase> {
        match self {
            UpgradeError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Version resolution error underneath this error, if any.
    #[must_use]
    pub fn version_error(&self) -> Option<&VersionError> {
        match self {
            UpgradeError::Phase { source, .. } => source.downcast_ref::<VersionError>(),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
