// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions used by the upgrade coordinator.
//!
//! The storage manager keeps cluster-wide configuration in [`Setting`]
//! resources, one per key. The upgrade owns exactly one of them,
//! `crd-api-version`, whose value records which CRD API version the cluster's
//! custom resources were last converted to.
//!
//! # Example: The version marker
//!
//! ```rust,no_run
//! use storage_upgrade::crd::{Setting, SettingSpec};
//!
//! let marker = Setting::new(
//!     "crd-api-version",
//!     SettingSpec {
//!         value: "v1beta2".to_string(),
//!     },
//! );
//! ```

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `Setting` holds one named configuration value of the storage manager.
///
/// # Example
///
/// ```yaml
/// apiVersion: storage.firestoned.io/v1beta2
/// kind: Setting
/// metadata:
///   name: crd-api-version
///   namespace: storage-system
/// spec:
///   value: v1beta2
/// ```
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "storage.firestoned.io",
    version = "v1beta2",
    kind = "Setting",
    namespaced,
    doc = "Setting stores one named configuration value of the storage manager. The crd-api-version setting records the API version the cluster's custom resources were last upgraded to."
)]
#[serde(rename_all = "camelCase")]
pub struct SettingSpec {
    /// Setting value.
    ///
    /// An empty value is treated the same as an absent setting.
    #[serde(default)]
    pub value: String,
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
