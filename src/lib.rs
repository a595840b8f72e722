// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # storage-upgrade - leader-elected upgrades for cluster-resident storage
//!
//! When a new release rolls out across the storage control-plane replicas,
//! exactly one replica migrates the shared cluster state while the others
//! wait their turn.
//!
//! ## Overview
//!
//! - Replicas compete for a `Lease`; only the holder runs the upgrade
//! - The winner settles the CRD API version stored in the `crd-api-version`
//!   `Setting`, converting legacy data when needed
//! - It then runs the migration chain: custom resources, pods, services and
//!   workloads, in that order, stopping at the first failure
//! - Every step checks the live state first, so a new leader can replay a run
//!   that was interrupted by a crash
//!
//! ## Modules
//!
//! - [`election`] - lease-based leader election
//! - [`version_store`] - the persisted CRD API version marker
//! - [`upgrade`] - version resolution, migration chain and the coordinator
//! - [`reconcilers`] - idempotent create/delete of managed objects
//! - [`csi`] - CSI driver workloads managed as object sets
//! - [`crd`] - the `Setting` custom resource
//!
//! ## Example
//!
//! ```rust,no_run
//! use storage_upgrade::upgrade::upgrade;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let run = upgrade(None, "node-a").await?;
//! println!("upgraded by {} in {} steps", run.leader, run.completed_steps.len());
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod context;
pub mod crd;
pub mod csi;
pub mod election;
pub mod errors;
pub mod labels;
pub mod metrics;
pub mod reconcilers;
pub mod upgrade;
pub mod version_store;

#[cfg(test)]
pub(crate) mod test_support;
