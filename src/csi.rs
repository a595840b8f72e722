// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CSI driver workloads managed as object sets.
//!
//! The CSI driver is made of three units:
//!
//! - [`AttacherDeployment`] - `csi-attacher` service + deployment
//! - [`ProvisionerDeployment`] - `csi-provisioner` service + deployment
//! - [`PluginDeployment`] - node plugin daemon set with the driver registrar
//!
//! Each unit builds its desired objects once and exposes them as an
//! [`ObjectSet`]; deploying installs the objects in order (service before the
//! deployment that references it), cleanup removes them concurrently.
//!
//! Every workload is stamped with the CSI driver version it was built for in
//! the `driver.storage.firestoned.io/version` annotation, so an upgrade can
//! tell stale workloads from current ones.

use crate::constants::{
    CSI_ATTACHER_NAME, CSI_DRIVER_NAME, CSI_PLUGIN_NAME, CSI_PROVISIONER_NAME,
    CSI_SERVICE_ACCOUNT, CSI_SERVICE_PORT, CSI_SOCKET_FILE_NAME,
    DEFAULT_CSI_ATTACHER_IMAGE, DEFAULT_CSI_ATTACHER_REPLICA_COUNT,
    DEFAULT_CSI_NODE_DRIVER_REGISTRAR_IMAGE, DEFAULT_CSI_PROVISIONER_IMAGE,
    DEFAULT_CSI_PROVISIONER_REPLICA_COUNT, DEFAULT_KUBELET_ROOT_DIR,
    IN_CONTAINER_CSI_REGISTRATION_DIR, IN_CONTAINER_CSI_SOCKET_DIR,
    ON_HOST_CSI_REGISTRATION_DIR_SUFFIX, ON_HOST_PLUGINS_DIR_SUFFIX,
};
use crate::errors::ObjectError;
use crate::labels::{
    CSI_VERSION_ANNOTATION, K8S_COMPONENT, K8S_MANAGED_BY, K8S_NAME, K8S_PART_OF,
    KUBERNETES_VERSION_ANNOTATION, MANAGED_BY_STORAGE_MANAGER, PART_OF_STORAGE,
};
use crate::reconcilers::{CleanupReport, KubeObject, ObjectSet};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ExecAction, HostPathVolumeSource, Lifecycle,
    LifecycleHandler, ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext, Service,
    ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Client;
use std::collections::BTreeMap;
use tracing::warn;

const HOST_PATH_DIRECTORY: &str = "Directory";
const HOST_PATH_DIRECTORY_OR_CREATE: &str = "DirectoryOrCreate";
const MOUNT_PROPAGATION_BIDIRECTIONAL: &str = "Bidirectional";

/// Settings shared by all CSI units.
#[derive(Debug, Clone)]
pub struct CsiOptions {
    /// Namespace the workloads run in
    pub namespace: String,
    /// Service account of every CSI pod
    pub service_account: String,
    /// Kubelet root directory on the host
    pub kubelet_root_dir: String,
    /// Tolerations applied to every CSI pod
    pub tolerations: Vec<Toleration>,
    /// Attacher sidecar image
    pub attacher_image: String,
    /// Provisioner sidecar image
    pub provisioner_image: String,
    /// Node driver registrar image
    pub node_driver_registrar_image: String,
    /// Storage manager image running the CSI plugin
    pub manager_image: String,
    /// URL the plugin uses to reach the storage manager
    pub manager_url: String,
    /// Attacher replicas
    pub attacher_replicas: i32,
    /// Provisioner replicas
    pub provisioner_replicas: i32,
    /// CSI driver version stamped on the workloads
    pub csi_version: String,
    /// Kubernetes version the workloads were built against, if known
    pub kubernetes_version: Option<String>,
}

impl CsiOptions {
    /// Options with the default images, replica counts and kubelet path.
    pub fn new(
        namespace: impl Into<String>,
        manager_image: impl Into<String>,
        manager_url: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_account: CSI_SERVICE_ACCOUNT.to_string(),
            kubelet_root_dir: DEFAULT_KUBELET_ROOT_DIR.to_string(),
            tolerations: Vec::new(),
            attacher_image: DEFAULT_CSI_ATTACHER_IMAGE.to_string(),
            provisioner_image: DEFAULT_CSI_PROVISIONER_IMAGE.to_string(),
            node_driver_registrar_image: DEFAULT_CSI_NODE_DRIVER_REGISTRAR_IMAGE.to_string(),
            manager_image: manager_image.into(),
            manager_url: manager_url.into(),
            attacher_replicas: DEFAULT_CSI_ATTACHER_REPLICA_COUNT,
            provisioner_replicas: DEFAULT_CSI_PROVISIONER_REPLICA_COUNT,
            csi_version: env!("CARGO_PKG_VERSION").to_string(),
            kubernetes_version: None,
        }
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Host directory holding the driver socket
#[must_use]
pub fn on_host_csi_socket_dir(root_dir: &str) -> String {
    format!("{}/{ON_HOST_PLUGINS_DIR_SUFFIX}/{CSI_DRIVER_NAME}", root_dir.trim_end_matches('/'))
}

/// Host path of the driver socket, as registered with the kubelet
#[must_use]
pub fn on_host_csi_socket_file(root_dir: &str) -> String {
    format!("{}/{CSI_SOCKET_FILE_NAME}", on_host_csi_socket_dir(root_dir))
}

/// Host directory holding kubelet plugin registrations
#[must_use]
pub fn on_host_registration_dir(root_dir: &str) -> String {
    format!("{}/{ON_HOST_CSI_REGISTRATION_DIR_SUFFIX}", root_dir.trim_end_matches('/'))
}

/// Host directory holding all kubelet plugins
#[must_use]
pub fn on_host_plugins_dir(root_dir: &str) -> String {
    format!("{}/{ON_HOST_PLUGINS_DIR_SUFFIX}", root_dir.trim_end_matches('/'))
}

/// Driver socket path inside the containers
#[must_use]
pub fn in_container_csi_socket_file() -> String {
    format!("{IN_CONTAINER_CSI_SOCKET_DIR}/{CSI_SOCKET_FILE_NAME}")
}

/// CSI endpoint the plugin listens on
#[must_use]
pub fn csi_endpoint() -> String {
    format!("unix://{}", in_container_csi_socket_file())
}

// ============================================================================
// Builders
// ============================================================================

fn build_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        (K8S_NAME.to_string(), name.to_string()),
        (K8S_COMPONENT.to_string(), "csi".to_string()),
        (K8S_PART_OF.to_string(), PART_OF_STORAGE.to_string()),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_STORAGE_MANAGER.to_string()),
    ])
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn build_annotations(opts: &CsiOptions) -> BTreeMap<String, String> {
    let mut annotations =
        BTreeMap::from([(CSI_VERSION_ANNOTATION.to_string(), opts.csi_version.clone())]);
    if let Some(version) = &opts.kubernetes_version {
        annotations.insert(KUBERNETES_VERSION_ANNOTATION.to_string(), version.clone());
    }
    annotations
}

fn build_metadata(name: &str, opts: &CsiOptions) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(opts.namespace.clone()),
        labels: Some(build_labels(name)),
        annotations: Some(build_annotations(opts)),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.into(),
        mount_path: path.into(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.into(),
        host_path: Some(HostPathVolumeSource {
            path: path.into(),
            type_: type_.map(Into::into),
        }),
        ..Default::default()
    }
}

fn pre_stop(script: String) -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec!["/bin/sh".into(), "-c".into(), script]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless-looking dummy service that gives the sidecar a stable identity.
#[must_use]
pub fn build_csi_service(name: &str, opts: &CsiOptions) -> Service {
    Service {
        metadata: build_metadata(name, opts),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("dummy".into()),
                port: CSI_SERVICE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Sidecar deployment talking to the driver over the shared socket directory.
#[must_use]
pub fn build_csi_sidecar_deployment(
    name: &str,
    image: &str,
    args: &[&str],
    replicas: i32,
    opts: &CsiOptions,
) -> Deployment {
    let container = Container {
        name: name.into(),
        image: Some(image.into()),
        args: Some(args.iter().map(ToString::to_string).collect()),
        env: Some(vec![
            env("ADDRESS", &in_container_csi_socket_file()),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(vec![mount("socket-dir", IN_CONTAINER_CSI_SOCKET_DIR)]),
        ..Default::default()
    };

    Deployment {
        metadata: build_metadata(name, opts),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(build_labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(opts.service_account.clone()),
                    tolerations: Some(opts.tolerations.clone()),
                    containers: vec![container],
                    volumes: Some(vec![host_path_volume(
                        "socket-dir",
                        &on_host_csi_socket_dir(&opts.kubelet_root_dir),
                        Some(HOST_PATH_DIRECTORY_OR_CREATE),
                    )]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Node plugin daemon set: driver registrar plus the CSI plugin itself.
#[must_use]
pub fn build_csi_plugin_daemon_set(opts: &CsiOptions) -> DaemonSet {
    let root = opts.kubelet_root_dir.trim_end_matches('/');
    let pods_dir = format!("{root}/pods");
    let in_container_plugins_dir = on_host_plugins_dir(DEFAULT_KUBELET_ROOT_DIR);

    let registrar = Container {
        name: "node-driver-registrar".into(),
        image: Some(opts.node_driver_registrar_image.clone()),
        lifecycle: Some(pre_stop(format!(
            "rm -rf {reg}/{CSI_DRIVER_NAME} {reg}/{CSI_DRIVER_NAME}-reg.sock {IN_CONTAINER_CSI_SOCKET_DIR}/*",
            reg = IN_CONTAINER_CSI_REGISTRATION_DIR
        ))),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        args: Some(vec![
            "--v=5".into(),
            "--csi-address=$(ADDRESS)".into(),
            format!(
                "--kubelet-registration-path={}",
                on_host_csi_socket_file(&opts.kubelet_root_dir)
            ),
        ]),
        env: Some(vec![env("ADDRESS", &in_container_csi_socket_file())]),
        volume_mounts: Some(vec![
            mount("socket-dir", IN_CONTAINER_CSI_SOCKET_DIR),
            mount("registration-dir", IN_CONTAINER_CSI_REGISTRATION_DIR),
        ]),
        ..Default::default()
    };

    let plugin = Container {
        name: CSI_PLUGIN_NAME.into(),
        image: Some(opts.manager_image.clone()),
        lifecycle: Some(pre_stop(format!("rm -f {IN_CONTAINER_CSI_SOCKET_DIR}/*"))),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            allow_privilege_escalation: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["SYS_ADMIN".into()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        args: Some(vec![
            "storage-manager".into(),
            "-d".into(),
            "csi".into(),
            "--nodeid=$(NODE_ID)".into(),
            "--endpoint=$(CSI_ENDPOINT)".into(),
            format!("--drivername={CSI_DRIVER_NAME}"),
            format!("--manager-url={}", opts.manager_url),
        ]),
        env: Some(vec![
            field_env("NODE_ID", "spec.nodeName"),
            env("CSI_ENDPOINT", &csi_endpoint()),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                mount_propagation: Some(MOUNT_PROPAGATION_BIDIRECTIONAL.into()),
                ..mount("plugin-dir", &in_container_plugins_dir)
            },
            mount("socket-dir", IN_CONTAINER_CSI_SOCKET_DIR),
            VolumeMount {
                mount_propagation: Some(MOUNT_PROPAGATION_BIDIRECTIONAL.into()),
                ..mount("pods-mount-dir", &pods_dir)
            },
            mount("host-dev", "/dev"),
            mount("host-sys", "/sys"),
            VolumeMount {
                read_only: Some(true),
                ..mount("lib-modules", "/lib/modules")
            },
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: build_metadata(CSI_PLUGIN_NAME, opts),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(CSI_PLUGIN_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(build_labels(CSI_PLUGIN_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(opts.service_account.clone()),
                    tolerations: Some(opts.tolerations.clone()),
                    containers: vec![registrar, plugin],
                    volumes: Some(vec![
                        host_path_volume(
                            "registration-dir",
                            &on_host_registration_dir(root),
                            Some(HOST_PATH_DIRECTORY),
                        ),
                        host_path_volume(
                            "socket-dir",
                            &on_host_csi_socket_dir(root),
                            Some(HOST_PATH_DIRECTORY_OR_CREATE),
                        ),
                        host_path_volume(
                            "plugin-dir",
                            &on_host_plugins_dir(root),
                            Some(HOST_PATH_DIRECTORY),
                        ),
                        host_path_volume(
                            "pods-mount-dir",
                            &pods_dir,
                            Some(HOST_PATH_DIRECTORY_OR_CREATE),
                        ),
                        host_path_volume("host-dev", "/dev", None),
                        host_path_volume("host-sys", "/sys", None),
                        host_path_volume("lib-modules", "/lib/modules", None),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Units
// ============================================================================

/// A CSI component installed and removed as one object set.
#[async_trait]
pub trait CsiUnit: Send + Sync {
    /// Name used in logs (e.g., "attacher deployment").
    fn unit_name(&self) -> &'static str;

    /// The unit's objects bound to `client`, in deploy order.
    ///
    /// # Errors
    ///
    /// Returns an error if an object lacks a name or namespace.
    fn object_set(&self, client: &Client) -> Result<ObjectSet, ObjectError>;

    /// Install every object of the unit, stopping at the first failure.
    async fn deploy(&self, client: &Client) -> Result<(), ObjectError> {
        self.object_set(client)?.deploy().await
    }

    /// Remove every object of the unit; failures are only reported.
    async fn cleanup(&self, client: &Client) -> CleanupReport {
        match self.object_set(client) {
            Ok(set) => set.cleanup().await,
            Err(e) => {
                warn!("Failed to cleanup {}: {}", self.unit_name(), e);
                CleanupReport {
                    removed: Vec::new(),
                    failed: vec![self.unit_name().to_string()],
                }
            }
        }
    }
}

/// `csi-attacher` service and deployment.
#[derive(Debug, Clone)]
pub struct AttacherDeployment {
    service: Service,
    deployment: Deployment,
}

impl AttacherDeployment {
    /// Build the desired objects.
    #[must_use]
    pub fn new(opts: &CsiOptions) -> Self {
        Self {
            service: build_csi_service(CSI_ATTACHER_NAME, opts),
            deployment: build_csi_sidecar_deployment(
                CSI_ATTACHER_NAME,
                &opts.attacher_image,
                &[
                    "--v=5",
                    "--csi-address=$(ADDRESS)",
                    "--leader-election",
                    "--leader-election-namespace=$(POD_NAMESPACE)",
                ],
                opts.attacher_replicas,
                opts,
            ),
        }
    }

    /// Desired service.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Desired deployment.
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }
}

impl CsiUnit for AttacherDeployment {
    fn unit_name(&self) -> &'static str {
        "attacher deployment"
    }

    fn object_set(&self, client: &Client) -> Result<ObjectSet, ObjectError> {
        Ok(ObjectSet::new(self.unit_name())
            .with(KubeObject::new(client, self.service.clone())?)
            .with(KubeObject::new(client, self.deployment.clone())?))
    }
}

/// `csi-provisioner` service and deployment.
#[derive(Debug, Clone)]
pub struct ProvisionerDeployment {
    service: Service,
    deployment: Deployment,
}

impl ProvisionerDeployment {
    /// Build the desired objects.
    #[must_use]
    pub fn new(opts: &CsiOptions) -> Self {
        Self {
            service: build_csi_service(CSI_PROVISIONER_NAME, opts),
            deployment: build_csi_sidecar_deployment(
                CSI_PROVISIONER_NAME,
                &opts.provisioner_image,
                &[
                    "--v=5",
                    "--csi-address=$(ADDRESS)",
                    "--enable-leader-election",
                    "--leader-election-type=leases",
                    "--leader-election-namespace=$(POD_NAMESPACE)",
                ],
                opts.provisioner_replicas,
                opts,
            ),
        }
    }

    /// Desired service.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Desired deployment.
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }
}

impl CsiUnit for ProvisionerDeployment {
    fn unit_name(&self) -> &'static str {
        "provisioner deployment"
    }

    fn object_set(&self, client: &Client) -> Result<ObjectSet, ObjectError> {
        Ok(ObjectSet::new(self.unit_name())
            .with(KubeObject::new(client, self.service.clone())?)
            .with(KubeObject::new(client, self.deployment.clone())?))
    }
}

/// CSI node plugin daemon set.
#[derive(Debug, Clone)]
pub struct PluginDeployment {
    daemon_set: DaemonSet,
}

impl PluginDeployment {
    /// Build the desired daemon set.
    #[must_use]
    pub fn new(opts: &CsiOptions) -> Self {
        Self {
            daemon_set: build_csi_plugin_daemon_set(opts),
        }
    }

    /// Desired daemon set.
    pub fn daemon_set(&self) -> &DaemonSet {
        &self.daemon_set
    }
}

impl CsiUnit for PluginDeployment {
    fn unit_name(&self) -> &'static str {
        "plugin deployment"
    }

    fn object_set(&self, client: &Client) -> Result<ObjectSet, ObjectError> {
        Ok(ObjectSet::new(self.unit_name()).with(KubeObject::new(client, self.daemon_set.clone())?))
    }
}

#[cfg(test)]
#[path = "csi_tests.rs"]
mod csi_tests;
