// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation primitives for the objects the upgrade manages.
//!
//! The upgrade never patches objects in place. It converges each object to
//! either "present" or "absent", and both directions are safe to repeat:
//!
//! 1. **Check** - read the live object
//! 2. **Act** - create it if missing, or delete it if present
//! 3. **Absorb races** - `AlreadyExists` on create and `NotFound` on delete
//!    mean another actor got there first, which is the desired outcome
//!
//! # Modules
//!
//! - [`resources`] - the [`ManagedObject`] trait, [`deploy`] and [`cleanup`]
//! - [`object_set`] - ordered fail-fast deploy and concurrent best-effort cleanup
//!   of a group of objects
//! - [`pagination`] - paged list calls used by migration steps
//! - [`retry`] - exponential backoff for transient API errors
//!
//! # Example
//!
//! ```rust,no_run
//! use storage_upgrade::reconcilers::{KubeObject, ObjectSet};
//! use k8s_openapi::api::apps::v1::Deployment;
//! use k8s_openapi::api::core::v1::Service;
//! use kube::Client;
//!
//! async fn install(client: &Client, svc: Service, deploy: Deployment) -> anyhow::Result<()> {
//!     let set = ObjectSet::new("attacher deployment")
//!         .with(KubeObject::new(client, svc)?)
//!         .with(KubeObject::new(client, deploy)?);
//!     set.deploy().await?;
//!     Ok(())
//! }
//! ```

pub mod object_set;
pub mod pagination;
pub mod resources;
pub mod retry;

pub use object_set::{CleanupReport, ObjectSet};
pub use pagination::list_all_paginated;
pub use resources::{cleanup, deploy, KubeObject, ManagedObject};
pub use retry::retry_api_call;
