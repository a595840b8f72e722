// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for an upgrade run.
//!
//! The context bundles what every upgrade component needs:
//! - Kubernetes client for API operations
//! - Namespace the control plane runs in (from `POD_NAMESPACE`)

use crate::constants::{DEFAULT_NAMESPACE, ENV_POD_NAMESPACE};
use anyhow::{Context as _, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, warn};

/// Shared context passed to the upgrade components.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// Namespace holding the version marker, the lease and the managed objects
    pub namespace: String,
}

impl Context {
    /// Build a client and detect the namespace.
    ///
    /// With `kubeconfig` set, that file is used; otherwise the in-cluster
    /// configuration or the default kubeconfig is inferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be built.
    pub async fn new(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = build_client(kubeconfig).await?;
        Ok(Self {
            client,
            namespace: pod_namespace(),
        })
    }

    /// Context over an existing client.
    #[must_use]
    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        debug!("Inferring Kubernetes client configuration");
        return Client::try_default()
            .await
            .context("unable to get client config");
    };

    debug!(path = %path.display(), "Loading kubeconfig");
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("unable to read kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("unable to load kubeconfig {}", path.display()))?;
    Client::try_from(config).context("unable to create Kubernetes client")
}

/// Namespace this pod runs in, falling back to `default`.
pub fn pod_namespace() -> String {
    namespace_or_default(std::env::var(ENV_POD_NAMESPACE).ok())
}

fn namespace_or_default(value: Option<String>) -> String {
    match value {
        Some(namespace) if !namespace.is_empty() => namespace,
        _ => {
            warn!(
                "Cannot detect pod namespace, environment variable {} is missing, using default namespace",
                ENV_POD_NAMESPACE
            );
            DEFAULT_NAMESPACE.to_string()
        }
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
