// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Persistent record of the CRD API version the cluster has been upgraded to.
//!
//! The marker is a single `Setting` named `crd-api-version`. Its value is one
//! of three things:
//!
//! - absent or empty: nothing has been recorded yet (fresh install)
//! - a legacy tag the current release can still convert from
//! - the current tag
//!
//! Writes are monotonic. Once a tag of a given rank is stored, writing a lower
//! ranked tag is a no-op, so a replica running an older release can never walk
//! the marker back.

use crate::constants::{CRD_API_VERSION_V1BETA1, CURRENT_CRD_API_VERSION, SETTING_NAME_CRD_API_VERSION};
use crate::crd::{Setting, SettingSpec};
use crate::errors::VersionError;
use crate::reconcilers::retry::retry_api_call;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Tags a release understands, ordered by age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersionPolicy {
    current: String,
    legacy: Vec<String>,
}

impl ApiVersionPolicy {
    /// Build a policy. `legacy` must be ordered oldest first.
    pub fn new(current: impl Into<String>, legacy: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            current: current.into(),
            legacy: legacy.into_iter().map(Into::into).collect(),
        }
    }

    /// Tag written by this release.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// Legacy tags, oldest first.
    pub fn legacy(&self) -> &[String] {
        &self.legacy
    }

    /// Returns true if `tag` is the current tag or a legacy tag.
    pub fn is_recognized(&self, tag: &str) -> bool {
        self.rank(tag).is_some()
    }

    /// Returns true if `tag` is a legacy tag.
    pub fn is_legacy(&self, tag: &str) -> bool {
        self.legacy.iter().any(|t| t == tag)
    }

    /// Position of `tag` in the upgrade order; the current tag ranks highest.
    pub fn rank(&self, tag: &str) -> Option<usize> {
        if tag == self.current {
            return Some(self.legacy.len());
        }
        self.legacy.iter().position(|t| t == tag)
    }
}

impl Default for ApiVersionPolicy {
    fn default() -> Self {
        Self::new(CURRENT_CRD_API_VERSION, [CRD_API_VERSION_V1BETA1])
    }
}

/// What a write has to do given what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkerWrite {
    Create,
    Update,
    Skip,
}

/// Decide how to move the stored marker to `tag` without ever lowering its rank.
///
/// `stored` is `None` when the setting does not exist; an empty stored value is
/// overwritten like a lower rank.
pub(crate) fn plan_marker_write(
    policy: &ApiVersionPolicy,
    stored: Option<&str>,
    tag: &str,
) -> Result<MarkerWrite, VersionError> {
    let new_rank = policy
        .rank(tag)
        .ok_or_else(|| VersionError::Unrecognized(tag.to_string()))?;

    match stored {
        None => Ok(MarkerWrite::Create),
        Some("") => Ok(MarkerWrite::Update),
        Some(existing) => {
            let old_rank = policy
                .rank(existing)
                .ok_or_else(|| VersionError::Unrecognized(existing.to_string()))?;
            if old_rank < new_rank {
                Ok(MarkerWrite::Update)
            } else {
                Ok(MarkerWrite::Skip)
            }
        }
    }
}

/// Access to the persisted version marker.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Read the stored tag; `None` when the marker is absent or empty.
    async fn read_marker(&self) -> Result<Option<String>>;

    /// Record `tag`, creating the marker if needed and never lowering it.
    async fn write_marker(&self, tag: &str) -> Result<()>;
}

/// Version marker kept in the `crd-api-version` `Setting`.
pub struct SettingVersionStore {
    api: Api<Setting>,
    namespace: String,
    policy: ApiVersionPolicy,
}

impl SettingVersionStore {
    /// Create a store for the setting in `namespace`.
    pub fn new(client: Client, namespace: &str, policy: ApiVersionPolicy) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            policy,
        }
    }

    async fn fetch(&self) -> Result<Option<Setting>> {
        retry_api_call(
            || self.api.get_opt(SETTING_NAME_CRD_API_VERSION),
            "get CRD API version setting",
        )
        .await
        .with_context(|| {
            format!(
                "cannot get setting {}/{}",
                self.namespace, SETTING_NAME_CRD_API_VERSION
            )
        })
    }
}

#[async_trait]
impl VersionStore for SettingVersionStore {
    async fn read_marker(&self) -> Result<Option<String>> {
        Ok(self
            .fetch()
            .await?
            .map(|setting| setting.spec.value)
            .filter(|value| !value.is_empty()))
    }

    async fn write_marker(&self, tag: &str) -> Result<()> {
        let stored = self.fetch().await?;
        let plan = plan_marker_write(
            &self.policy,
            stored.as_ref().map(|s| s.spec.value.as_str()),
            tag,
        )?;

        let post_params = PostParams::default();
        match (plan, stored) {
            (MarkerWrite::Create, _) | (MarkerWrite::Update, None) => {
                let setting = Setting {
                    metadata: ObjectMeta {
                        name: Some(SETTING_NAME_CRD_API_VERSION.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: SettingSpec {
                        value: tag.to_string(),
                    },
                };
                match retry_api_call(
                    || self.api.create(&post_params, &setting),
                    "create CRD API version setting",
                )
                .await
                {
                    Ok(_) => {
                        info!("Recorded CRD API version {}", tag);
                        Ok(())
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        debug!("CRD API version setting was created concurrently");
                        Ok(())
                    }
                    Err(e) => Err(e).context("cannot create CRD API version setting"),
                }
            }
            (MarkerWrite::Update, Some(mut setting)) => {
                setting.spec.value = tag.to_string();
                retry_api_call(
                    || {
                        self.api
                            .replace(SETTING_NAME_CRD_API_VERSION, &post_params, &setting)
                    },
                    "update CRD API version setting",
                )
                .await
                .with_context(|| {
                    format!("cannot finish CRD API upgrade by setting the CRD API version to {tag}")
                })?;
                info!("Recorded CRD API version {}", tag);
                Ok(())
            }
            (MarkerWrite::Skip, _) => {
                debug!("CRD API version is already at or past {}", tag);
                Ok(())
            }
        }
    }
}

/// Process-local version marker.
#[derive(Debug)]
pub struct MemoryVersionStore {
    value: Mutex<Option<String>>,
    policy: ApiVersionPolicy,
    writes: AtomicUsize,
}

impl MemoryVersionStore {
    /// An empty store, as on a fresh install.
    pub fn new(policy: ApiVersionPolicy) -> Self {
        Self {
            value: Mutex::new(None),
            policy,
            writes: AtomicUsize::new(0),
        }
    }

    /// A store that already holds `tag`.
    pub fn with_marker(policy: ApiVersionPolicy, tag: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(tag.into())),
            policy,
            writes: AtomicUsize::new(0),
        }
    }

    /// Current stored value, including an empty one.
    pub fn stored(&self) -> Option<String> {
        self.value.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Number of writes that changed the stored value.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn read_marker(&self) -> Result<Option<String>> {
        Ok(self.stored().filter(|value| !value.is_empty()))
    }

    async fn write_marker(&self, tag: &str) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("version store lock poisoned"))?;

        match plan_marker_write(&self.policy, value.as_deref(), tag)? {
            MarkerWrite::Create | MarkerWrite::Update => {
                *value = Some(tag.to_string());
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            MarkerWrite::Skip => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "version_store_tests.rs"]
mod version_store_tests;
