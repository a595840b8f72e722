// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Label and annotation constants used on objects the upgrade touches.
//!
//! Kubernetes standard labels are applied to every managed object so that
//! cleanup steps can find what an earlier release created.

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the component name within the architecture (e.g., "csi-attacher")
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the name of the application
pub const K8S_NAME: &str = "app.kubernetes.io/name";

/// Standard label for the name of a higher-level application this one is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

// ============================================================================
// Label Values
// ============================================================================

/// Value for `app.kubernetes.io/part-of`
pub const PART_OF_STORAGE: &str = "storage-manager";

/// Value for `app.kubernetes.io/managed-by`
pub const MANAGED_BY_STORAGE_MANAGER: &str = "storage-manager";

// ============================================================================
// Storage-Specific Labels and Annotations
// ============================================================================

/// Pod label recording which release last upgraded the pod
pub const UPGRADED_BY_LABEL: &str = "storage.firestoned.io/upgraded-by";

/// Annotation recording the CRD API version a custom resource was stamped with
pub const API_VERSION_ANNOTATION: &str = "storage.firestoned.io/api-version";

/// Annotation recording the CSI driver version a workload was deployed with
pub const CSI_VERSION_ANNOTATION: &str = "driver.storage.firestoned.io/version";

/// Annotation recording the Kubernetes version a workload was deployed against
pub const KUBERNETES_VERSION_ANNOTATION: &str = "driver.storage.firestoned.io/kubernetes-version";
