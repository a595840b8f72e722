// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Generic create/verify/delete reconciliation for managed cluster objects.
//!
//! Every object the upgrade installs or removes is reached through the
//! [`ManagedObject`] capability trait (`get`, `create`, `delete`). The two
//! directions treat races differently:
//!
//! - [`deploy`] creates the object when it is missing; `AlreadyExists` from
//!   `create` means another actor won the race and counts as success.
//! - [`cleanup`] deletes the object when it is present; `NotFound` from
//!   `delete` counts as success.
//!
//! [`KubeObject`] adapts any namespaced `k8s-openapi` kind to the trait.
//!
//! # Example
//!
//! ```rust,no_run
//! use storage_upgrade::reconcilers::resources::{deploy, KubeObject};
//! use k8s_openapi::api::core::v1::Service;
//! use kube::Client;
//!
//! async fn example(client: &Client, service: Service) -> anyhow::Result<()> {
//!     let object = KubeObject::new(client, service)?;
//!     deploy(&object).await?;
//!     Ok(())
//! }
//! ```

use crate::errors::ObjectError;
use crate::metrics::{record_object_created, record_object_deleted};
use crate::reconcilers::retry::retry_api_call;
use async_trait::async_trait;
use kube::api::{DeleteParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

/// A declarative cluster object plus the three operations bound to its kind.
///
/// The real state lives in the cluster; implementations hold only the desired
/// object and whatever handle they need to reach the cluster.
#[async_trait]
pub trait ManagedObject: Send + Sync {
    /// Kind of the object (e.g., `Service`)
    fn kind(&self) -> &str;

    /// Namespace of the object
    fn namespace(&self) -> &str;

    /// Name of the object
    fn name(&self) -> &str;

    /// Whether the object currently exists.
    async fn get(&self) -> Result<bool, ObjectError>;

    /// Create the object from its desired state.
    async fn create(&self) -> Result<(), ObjectError>;

    /// Delete the object.
    async fn delete(&self) -> Result<(), ObjectError>;
}

/// Bring an object into existence.
///
/// # Errors
///
/// Returns any `get` error, and any `create` error other than `AlreadyExists`.
pub async fn deploy(object: &dyn ManagedObject) -> Result<(), ObjectError> {
    if object.get().await? {
        debug!(
            kind = %object.kind(),
            namespace = %object.namespace(),
            name = %object.name(),
            "Managed object already exists, nothing to deploy"
        );
        return Ok(());
    }

    match object.create().await {
        Ok(()) => {
            info!(
                "Created {} {}/{}",
                object.kind(),
                object.namespace(),
                object.name()
            );
            record_object_created(object.kind());
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(
                "{} {}/{} was created concurrently, treating as deployed",
                object.kind(),
                object.namespace(),
                object.name()
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Remove an object from the cluster.
///
/// # Errors
///
/// Returns any `get` error, and any `delete` error other than `NotFound`.
pub async fn cleanup(object: &dyn ManagedObject) -> Result<(), ObjectError> {
    if !object.get().await? {
        debug!(
            kind = %object.kind(),
            namespace = %object.namespace(),
            name = %object.name(),
            "Managed object already absent, nothing to clean up"
        );
        return Ok(());
    }

    match object.delete().await {
        Ok(()) => {
            info!(
                "Deleted {} {}/{}",
                object.kind(),
                object.namespace(),
                object.name()
            );
            record_object_deleted(object.kind());
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(
                "{} {}/{} was deleted concurrently",
                object.kind(),
                object.namespace(),
                object.name()
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// [`ManagedObject`] adapter for any namespaced Kubernetes kind.
///
/// Deletes use foreground propagation so dependents (pods of a deployment)
/// are gone before the owner disappears.
pub struct KubeObject<K> {
    api: Api<K>,
    desired: K,
    kind: String,
    namespace: String,
    name: String,
}

impl<K> KubeObject<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Wrap a desired object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no name or no namespace in its metadata.
    pub fn new(client: &Client, desired: K) -> Result<Self, ObjectError> {
        let kind = K::kind(&()).to_string();
        let name = desired.meta().name.clone().unwrap_or_default();
        let namespace = desired.namespace().unwrap_or_default();

        if name.is_empty() || namespace.is_empty() {
            return Err(ObjectError::Api {
                operation: "build",
                kind,
                namespace,
                name,
                source: anyhow::anyhow!("managed objects must have a name and a namespace"),
            });
        }

        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
            desired,
            kind,
            namespace,
            name,
        })
    }

    /// The desired state this object is reconciled towards.
    pub fn desired(&self) -> &K {
        &self.desired
    }

    /// Fetch the live object, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails for any reason other than 404.
    pub async fn live(&self) -> Result<Option<K>, ObjectError> {
        retry_api_call(
            || self.api.get_opt(&self.name),
            &format!("get {} {}/{}", self.kind, self.namespace, self.name),
        )
        .await
        .map_err(|e| self.classify("get", e))
    }

    fn classify(&self, operation: &'static str, err: kube::Error) -> ObjectError {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => ObjectError::AlreadyExists {
                kind: self.kind.clone(),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            },
            kube::Error::Api(ae) if ae.code == 404 => ObjectError::NotFound {
                kind: self.kind.clone(),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            },
            other => ObjectError::Api {
                operation,
                kind: self.kind.clone(),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                source: other.into(),
            },
        }
    }
}

#[async_trait]
impl<K> ManagedObject for KubeObject<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<bool, ObjectError> {
        Ok(self.live().await?.is_some())
    }

    async fn create(&self) -> Result<(), ObjectError> {
        let post_params = PostParams::default();
        retry_api_call(
            || self.api.create(&post_params, &self.desired),
            &format!("create {} {}/{}", self.kind, self.namespace, self.name),
        )
        .await
        .map(|_| ())
        .map_err(|e| self.classify("create", e))
    }

    async fn delete(&self) -> Result<(), ObjectError> {
        let delete_params = DeleteParams::foreground();
        retry_api_call(
            || self.api.delete(&self.name, &delete_params),
            &format!("delete {} {}/{}", self.kind, self.namespace, self.name),
        )
        .await
        .map(|_| ())
        .map_err(|e| self.classify("delete", e))
    }
}

#[cfg(test)]
#[path = "resources_tests.rs"]
mod resources_tests;
