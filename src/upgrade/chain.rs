// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Ordered migration steps grouped by phase.

use crate::errors::Phase;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// One unit of migration work.
///
/// Steps must be safe to run again: a run interrupted after a step completed
/// replays it on the next leader.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Name used in logs and error context.
    fn name(&self) -> &str;

    /// Perform the migration.
    async fn apply(&self) -> anyhow::Result<()>;
}

/// Boxed future returned by [`FnStep`] closures.
pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A [`MigrationStep`] built from a closure.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn() -> StepFuture + Send + Sync,
{
    /// Wrap `f` as a step called `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> MigrationStep for FnStep<F>
where
    F: Fn() -> StepFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}

/// Steps to run after the API version is settled.
///
/// Phases always run in [`Phase::CHAIN`] order; within a phase, steps run in
/// registration order.
#[derive(Default)]
pub struct MigrationChain {
    steps: Vec<(Phase, Box<dyn MigrationStep>)>,
}

impl MigrationChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step in `phase`.
    ///
    /// # Panics
    ///
    /// Panics if `phase` is [`Phase::ApiVersion`], which has no registered
    /// steps, or [`Phase::LocalNode`], whose steps belong to the coordinator.
    #[must_use]
    pub fn with_step(mut self, phase: Phase, step: impl MigrationStep + 'static) -> Self {
        assert!(
            phase != Phase::ApiVersion,
            "the API version phase is driven by version resolution"
        );
        assert!(
            phase != Phase::LocalNode,
            "local node steps run before the election"
        );
        self.steps.push((phase, Box::new(step)));
        self
    }

    /// Register a custom resource upgrader.
    #[must_use]
    pub fn with_custom_resource_step(self, step: impl MigrationStep + 'static) -> Self {
        self.with_step(Phase::CustomResources, step)
    }

    /// Register a pod upgrader.
    #[must_use]
    pub fn with_pod_step(self, step: impl MigrationStep + 'static) -> Self {
        self.with_step(Phase::Pods, step)
    }

    /// Register a service upgrader.
    #[must_use]
    pub fn with_service_step(self, step: impl MigrationStep + 'static) -> Self {
        self.with_step(Phase::Services, step)
    }

    /// Register a deployment or daemon set upgrader.
    #[must_use]
    pub fn with_workload_step(self, step: impl MigrationStep + 'static) -> Self {
        self.with_step(Phase::Workloads, step)
    }

    /// Steps registered in `phase`, in registration order.
    pub fn steps(&self, phase: Phase) -> impl Iterator<Item = &dyn MigrationStep> {
        self.steps
            .iter()
            .filter(move |(p, _)| *p == phase)
            .map(|(_, step)| &**step)
    }

    /// Total number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no step is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for MigrationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|(phase, step)| (phase, step.name())))
            .finish()
    }
}

#[cfg(test)]
#[path = "chain_tests.rs"]
mod chain_tests;
