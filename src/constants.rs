// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the upgrade coordinator.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for the storage manager CRDs
pub const API_GROUP: &str = "storage.firestoned.io";

/// Kind name for the `Setting` resource
pub const KIND_SETTING: &str = "Setting";

/// Legacy CRD API version that can still be converted in place
pub const CRD_API_VERSION_V1BETA1: &str = "v1beta1";

/// CRD API version written by this release
pub const CRD_API_VERSION_V1BETA2: &str = "v1beta2";

/// The API version every upgraded cluster ends up on
pub const CURRENT_CRD_API_VERSION: &str = CRD_API_VERSION_V1BETA2;

/// Pre-versioning API version; installations still on it cannot be upgraded directly
pub const CRD_API_VERSION_V1ALPHA1: &str = "v1alpha1";

/// Name of the `Setting` that records the cluster's CRD API version
pub const SETTING_NAME_CRD_API_VERSION: &str = "crd-api-version";

/// CRDs whose stored versions are inspected on a fresh install
pub const LEGACY_CRD_NAMES: &[&str] = &[
    "engines.storage.firestoned.io",
    "replicas.storage.firestoned.io",
    "settings.storage.firestoned.io",
    "volumes.storage.firestoned.io",
];

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Name of the `Lease` guarding the upgrade
pub const UPGRADE_LEASE_NAME: &str = "storage-manager-upgrade-lock";

/// Upgrade lease duration (20 seconds)
pub const UPGRADE_LEASE_DURATION_SECS: u64 = 20;

/// Upgrade lease renew deadline (10 seconds)
pub const UPGRADE_LEASE_RENEW_DEADLINE_SECS: u64 = 10;

/// Upgrade lease retry period (2 seconds)
pub const UPGRADE_LEASE_RETRY_PERIOD_SECS: u64 = 2;

/// Lease duration written when the holder releases the lease
pub const RELEASED_LEASE_DURATION_SECS: u64 = 1;

// ============================================================================
// Environment
// ============================================================================

/// Environment variable carrying the pod namespace (downward API)
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";

/// Namespace used when `POD_NAMESPACE` is not set
pub const DEFAULT_NAMESPACE: &str = "default";

/// Page size for list calls against the API server
pub const KUBE_LIST_PAGE_SIZE: u32 = 100;

/// Services created by earlier releases and no longer used
pub const OBSOLETE_SERVICE_NAMES: &[&str] = &["storage-csi-attacher", "storage-csi-provisioner"];

// ============================================================================
// CSI Driver Constants
// ============================================================================

/// CSI driver name registered with the kubelet
pub const CSI_DRIVER_NAME: &str = "driver.storage.firestoned.io";

/// Name of the CSI attacher service and deployment
pub const CSI_ATTACHER_NAME: &str = "csi-attacher";

/// Name of the CSI provisioner service and deployment
pub const CSI_PROVISIONER_NAME: &str = "csi-provisioner";

/// Name of the CSI plugin daemon set
pub const CSI_PLUGIN_NAME: &str = "storage-csi-plugin";

/// Default CSI attacher sidecar image
pub const DEFAULT_CSI_ATTACHER_IMAGE: &str = "quay.io/k8scsi/csi-attacher:v2.0.0";

/// Default CSI provisioner sidecar image
pub const DEFAULT_CSI_PROVISIONER_IMAGE: &str = "quay.io/k8scsi/csi-provisioner:v1.4.0";

/// Default node driver registrar sidecar image
pub const DEFAULT_CSI_NODE_DRIVER_REGISTRAR_IMAGE: &str =
    "quay.io/k8scsi/csi-node-driver-registrar:v1.2.0";

/// Default attacher replica count
pub const DEFAULT_CSI_ATTACHER_REPLICA_COUNT: i32 = 3;

/// Default provisioner replica count
pub const DEFAULT_CSI_PROVISIONER_REPLICA_COUNT: i32 = 3;

/// Kubelet root directory as seen from inside the plugin container
pub const DEFAULT_KUBELET_ROOT_DIR: &str = "/var/lib/kubelet";

/// CSI socket file name
pub const CSI_SOCKET_FILE_NAME: &str = "csi.sock";

/// In-container directory holding the CSI socket
pub const IN_CONTAINER_CSI_SOCKET_DIR: &str = "/csi";

/// In-container directory holding kubelet plugin registrations
pub const IN_CONTAINER_CSI_REGISTRATION_DIR: &str = "/registration";

/// On-host suffix of the kubelet plugin registration directory
pub const ON_HOST_CSI_REGISTRATION_DIR_SUFFIX: &str = "plugins_registry";

/// On-host suffix of the kubelet plugins directory
pub const ON_HOST_PLUGINS_DIR_SUFFIX: &str = "plugins";

/// Port exposed by the dummy service fronting the CSI sidecars
pub const CSI_SERVICE_PORT: i32 = 12345;

/// Service account the CSI workloads run as
pub const CSI_SERVICE_ACCOUNT: &str = "storage-service-account";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

/// Time given to the elector to release the lease after a termination signal
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 2;
