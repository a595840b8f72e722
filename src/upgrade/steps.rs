// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Migration steps shipped with this release.
//!
//! Every step looks at the live state first and only writes what is missing,
//! so replaying a step after an interrupted run is harmless.

use super::chain::{MigrationChain, MigrationStep};
use super::version::{InstallProbe, LegacyConversion};
use super::Upgrader;
use crate::constants::{
    CRD_API_VERSION_V1ALPHA1, CRD_API_VERSION_V1BETA1, LEGACY_CRD_NAMES,
    OBSOLETE_SERVICE_NAMES,
};
use crate::context::Context;
use crate::crd::Setting;
use crate::csi::{AttacherDeployment, CsiOptions, CsiUnit, PluginDeployment, ProvisionerDeployment};
use crate::labels::{API_VERSION_ANNOTATION, CSI_VERSION_ANNOTATION, K8S_PART_OF, PART_OF_STORAGE, UPGRADED_BY_LABEL};
use crate::reconcilers::{list_all_paginated, retry_api_call, KubeObject, ObjectSet};
use crate::version_store::{ApiVersionPolicy, SettingVersionStore};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn value_differs(values: &BTreeMap<String, String>, key: &str, wanted: &str) -> bool {
    values.get(key).map(String::as_str) != Some(wanted)
}

/// Stamps every `Setting` with the API version it was last written under.
///
/// Also serves as the conversion from `v1beta1`: the spec layout did not
/// change between the two versions, only the stamp is new.
pub struct SettingsApiVersionAnnotation {
    api: Api<Setting>,
    version: String,
}

impl SettingsApiVersionAnnotation {
    /// Annotate settings in `namespace` with `version`.
    pub fn new(client: Client, namespace: &str, version: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            version: version.into(),
        }
    }

    async fn annotate(&self) -> Result<()> {
        let settings = list_all_paginated(&self.api, ListParams::default()).await?;
        let patch = json!({
            "metadata": {
                "annotations": {
                    API_VERSION_ANNOTATION: self.version
                }
            }
        });
        let merge = Patch::Merge(&patch);
        let patch_params = PatchParams::default();

        let mut patched = 0;
        for setting in settings
            .iter()
            .filter(|s| value_differs(s.annotations(), API_VERSION_ANNOTATION, &self.version))
        {
            let name = setting.name_any();
            retry_api_call(
                || self.api.patch(&name, &patch_params, &merge),
                &format!("annotate setting {name}"),
            )
            .await
            .with_context(|| format!("cannot annotate setting {name}"))?;
            patched += 1;
        }

        if patched > 0 {
            info!(
                "Annotated {} setting(s) with API version {}",
                patched, self.version
            );
        } else {
            debug!("All settings already carry API version {}", self.version);
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationStep for SettingsApiVersionAnnotation {
    fn name(&self) -> &str {
        "settings-api-version-annotation"
    }

    async fn apply(&self) -> Result<()> {
        self.annotate().await
    }
}

#[async_trait]
impl LegacyConversion for SettingsApiVersionAnnotation {
    fn from_version(&self) -> &str {
        CRD_API_VERSION_V1BETA1
    }

    async fn convert(&self) -> Result<()> {
        self.annotate().await
    }
}

/// Labels storage pods with the release that upgraded them.
pub struct LabelPods {
    api: Api<Pod>,
    selector: String,
    value: String,
}

impl LabelPods {
    /// Label pods matching `selector` in `namespace` with `value`.
    pub fn new(
        client: Client,
        namespace: &str,
        selector: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            selector: selector.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl MigrationStep for LabelPods {
    fn name(&self) -> &str {
        "label-storage-pods"
    }

    async fn apply(&self) -> Result<()> {
        let pods =
            list_all_paginated(&self.api, ListParams::default().labels(&self.selector)).await?;
        let patch = json!({
            "metadata": {
                "labels": {
                    UPGRADED_BY_LABEL: self.value
                }
            }
        });
        let merge = Patch::Merge(&patch);
        let patch_params = PatchParams::default();

        for pod in pods
            .iter()
            .filter(|p| value_differs(p.labels(), UPGRADED_BY_LABEL, &self.value))
        {
            let name = pod.name_any();
            retry_api_call(
                || self.api.patch(&name, &patch_params, &merge),
                &format!("label pod {name}"),
            )
            .await
            .with_context(|| format!("cannot label pod {name}"))?;
            debug!(pod = %name, "Labeled storage pod");
        }
        Ok(())
    }
}

/// Removes services left behind by earlier releases.
///
/// Best-effort: a service that cannot be removed is logged and skipped.
pub struct RemoveObsoleteServices {
    client: Client,
    namespace: String,
    names: Vec<String>,
}

impl RemoveObsoleteServices {
    /// Remove `names` from `namespace`.
    pub fn new(
        client: Client,
        namespace: &str,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl MigrationStep for RemoveObsoleteServices {
    fn name(&self) -> &str {
        "remove-obsolete-services"
    }

    async fn apply(&self) -> Result<()> {
        let mut set = ObjectSet::new("obsolete services");
        for name in &self.names {
            let service = Service {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            set.push(Box::new(KubeObject::new(&self.client, service)?));
        }

        let report = set.cleanup().await;
        if !report.is_complete() {
            warn!(
                "Leaving obsolete services in place: {}",
                report.failed.join(", ")
            );
        }
        Ok(())
    }
}

/// Removes CSI workloads built for another driver version.
///
/// The driver deployer recreates them from the current specs afterwards.
pub struct RemoveStaleCsiWorkloads {
    client: Client,
    options: CsiOptions,
}

impl RemoveStaleCsiWorkloads {
    /// Compare live workloads against `options.csi_version`.
    pub fn new(client: Client, options: CsiOptions) -> Self {
        Self { client, options }
    }

    async fn is_stale<K>(&self, desired: &K) -> Result<bool>
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
        let live = KubeObject::new(&self.client, desired.clone())?.live().await?;
        Ok(live.is_some_and(|live| {
            value_differs(live.annotations(), CSI_VERSION_ANNOTATION, &self.options.csi_version)
        }))
    }
}

#[async_trait]
impl MigrationStep for RemoveStaleCsiWorkloads {
    fn name(&self) -> &str {
        "remove-stale-csi-workloads"
    }

    async fn apply(&self) -> Result<()> {
        let attacher = AttacherDeployment::new(&self.options);
        let provisioner = ProvisionerDeployment::new(&self.options);
        let plugin = PluginDeployment::new(&self.options);

        let mut stale: Vec<&dyn CsiUnit> = Vec::new();
        if self.is_stale(attacher.deployment()).await? {
            stale.push(&attacher);
        }
        if self.is_stale(provisioner.deployment()).await? {
            stale.push(&provisioner);
        }
        if self.is_stale(plugin.daemon_set()).await? {
            stale.push(&plugin);
        }

        for unit in stale {
            let report = unit.cleanup(&self.client).await;
            if !report.is_complete() {
                anyhow::bail!(
                    "failed to remove stale CSI {}: {}",
                    unit.unit_name(),
                    report.failed.join(", ")
                );
            }
            info!(
                "Removed stale CSI {} built for another driver version",
                unit.unit_name()
            );
        }
        Ok(())
    }
}

/// Refuses a fresh-install stamp when CRDs still store `v1alpha1` objects.
pub struct LegacyCrdProbe {
    api: Api<CustomResourceDefinition>,
}

impl LegacyCrdProbe {
    /// Probe the cluster's CRDs.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl InstallProbe for LegacyCrdProbe {
    async fn can_upgrade(&self) -> Result<bool> {
        for name in LEGACY_CRD_NAMES {
            let crd = retry_api_call(|| self.api.get_opt(name), &format!("get CRD {name}"))
                .await
                .with_context(|| format!("cannot get CRD {name}"))?;

            let stored_versions = crd
                .as_ref()
                .and_then(|crd| crd.status.as_ref())
                .and_then(|status| status.stored_versions.as_deref())
                .unwrap_or_default();

            if !stored_versions.is_empty()
                && stored_versions
                    .iter()
                    .all(|v| v == CRD_API_VERSION_V1ALPHA1)
            {
                warn!(
                    "CRD {} only stores {} objects, which cannot be upgraded",
                    name, CRD_API_VERSION_V1ALPHA1
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The upgrader run by every control-plane replica.
pub fn production_upgrader(ctx: &Context) -> Upgrader {
    let policy = ApiVersionPolicy::default();
    let current = policy.current().to_string();
    let release = env!("CARGO_PKG_VERSION");

    let store = Arc::new(SettingVersionStore::new(
        ctx.client.clone(),
        &ctx.namespace,
        policy.clone(),
    ));
    let probe = Arc::new(LegacyCrdProbe::new(ctx.client.clone()));
    let conversion = Arc::new(SettingsApiVersionAnnotation::new(
        ctx.client.clone(),
        &ctx.namespace,
        current.clone(),
    ));

    // Only names and namespace matter when removing workloads
    let csi = CsiOptions::new(ctx.namespace.clone(), String::new(), String::new());

    let chain = MigrationChain::new()
        .with_custom_resource_step(SettingsApiVersionAnnotation::new(
            ctx.client.clone(),
            &ctx.namespace,
            current,
        ))
        .with_pod_step(LabelPods::new(
            ctx.client.clone(),
            &ctx.namespace,
            format!("{K8S_PART_OF}={PART_OF_STORAGE}"),
            release,
        ))
        .with_service_step(RemoveObsoleteServices::new(
            ctx.client.clone(),
            &ctx.namespace,
            OBSOLETE_SERVICE_NAMES.iter().copied(),
        ))
        .with_workload_step(RemoveStaleCsiWorkloads::new(ctx.client.clone(), csi));

    Upgrader::new(policy, store, probe)
        .with_conversion(conversion)
        .with_chain(chain)
}

#[cfg(test)]
#[path = "steps_tests.rs"]
mod steps_tests;
