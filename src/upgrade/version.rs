// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CRD API version resolution, the first phase of every upgrade run.

use crate::errors::VersionError;
use crate::version_store::{ApiVersionPolicy, VersionStore};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Decides whether a cluster without a version marker can be brought to the
/// current API version.
#[async_trait]
pub trait InstallProbe: Send + Sync {
    /// Returns false if existing cluster state rules out an upgrade.
    async fn can_upgrade(&self) -> Result<bool>;
}

/// Data conversion from one legacy API version to the current one.
#[async_trait]
pub trait LegacyConversion: Send + Sync {
    /// Legacy tag this conversion starts from.
    fn from_version(&self) -> &str;

    /// Convert existing objects. Must be safe to run again.
    async fn convert(&self) -> Result<()>;
}

/// How the API version phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionResolution {
    /// The marker already holds the current tag
    UpToDate,
    /// No marker; the current tag was written
    FreshInstall,
    /// A legacy tag was converted and the current tag written
    Converted {
        /// Tag that was found
        from: String,
    },
    /// No marker, and the probe refused; nothing was written
    NotUpgradable,
}

impl fmt::Display for VersionResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionResolution::UpToDate => f.write_str("up to date"),
            VersionResolution::FreshInstall => f.write_str("fresh install"),
            VersionResolution::Converted { from } => write!(f, "converted from {from}"),
            VersionResolution::NotUpgradable => f.write_str("not upgradable"),
        }
    }
}

/// Bring the stored API version to `policy.current()`.
///
/// # Errors
///
/// Returns a [`VersionError`] (inside the `anyhow` chain) when the stored tag
/// is unknown or has no registered conversion, and any store, probe or
/// conversion failure. Nothing is written on error.
pub async fn resolve_api_version(
    policy: &ApiVersionPolicy,
    store: &dyn VersionStore,
    probe: &dyn InstallProbe,
    conversions: &[Arc<dyn LegacyConversion>],
) -> Result<VersionResolution> {
    let current = policy.current();
    let stored = store
        .read_marker()
        .await
        .context("failed to read the CRD API version")?
        .unwrap_or_default();

    if stored == current {
        info!("No API version upgrade is needed");
        return Ok(VersionResolution::UpToDate);
    }

    if stored.is_empty() {
        if !probe
            .can_upgrade()
            .await
            .context("failed to check existing resources")?
        {
            warn!(
                "Existing resources cannot be upgraded to {}, leaving the CRD API version unset",
                current
            );
            return Ok(VersionResolution::NotUpgradable);
        }
        store.write_marker(current).await?;
        info!("New {} installation", current);
        return Ok(VersionResolution::FreshInstall);
    }

    if !policy.is_legacy(&stored) {
        return Err(VersionError::Unrecognized(stored).into());
    }

    let conversion = conversions
        .iter()
        .find(|c| c.from_version() == stored)
        .ok_or_else(|| VersionError::Unsupported {
            from: stored.clone(),
            to: current.to_string(),
        })?;

    info!("Upgrading from {} to {}", stored, current);
    conversion
        .convert()
        .await
        .with_context(|| format!("failed to convert resources from {stored} to {current}"))?;
    store.write_marker(current).await?;
    info!("CRD has been upgraded to {}", current);

    Ok(VersionResolution::Converted { from: stored })
}

#[cfg(test)]
#[path = "version_tests.rs"]
mod version_tests;
