// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `csi.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::test_support::{mock_client, object_body, status_body, TEST_NAMESPACE};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERVICES_PATH: &str = "/api/v1/namespaces/storage-system/services";
    const DEPLOYMENTS_PATH: &str = "/apis/apps/v1/namespaces/storage-system/deployments";

    fn options() -> CsiOptions {
        CsiOptions::new(
            TEST_NAMESPACE,
            "firestoned/storage-manager:v0.5.0",
            "http://storage-backend:9500/v1",
        )
    }

    #[test]
    fn test_host_paths_follow_kubelet_root() {
        assert_eq!(
            on_host_csi_socket_dir("/var/lib/kubelet/"),
            "/var/lib/kubelet/plugins/driver.storage.firestoned.io"
        );
        assert_eq!(
            on_host_csi_socket_file("/var/lib/kubelet"),
            "/var/lib/kubelet/plugins/driver.storage.firestoned.io/csi.sock"
        );
        assert_eq!(
            on_host_registration_dir("/var/lib/kubelet"),
            "/var/lib/kubelet/plugins_registry"
        );
        assert_eq!(csi_endpoint(), "unix:///csi/csi.sock");
    }

    #[test]
    fn test_options_defaults() {
        let opts = options();

        assert_eq!(opts.service_account, CSI_SERVICE_ACCOUNT);
        assert_eq!(opts.kubelet_root_dir, DEFAULT_KUBELET_ROOT_DIR);
        assert_eq!(opts.attacher_replicas, 3);
        assert_eq!(opts.provisioner_replicas, 3);
        assert_eq!(opts.csi_version, env!("CARGO_PKG_VERSION"));
        assert!(opts.kubernetes_version.is_none());
    }

    #[test]
    fn test_csi_service_selects_its_deployment() {
        let service = build_csi_service(CSI_ATTACHER_NAME, &options());
        let spec = service.spec.unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some(CSI_ATTACHER_NAME));
        assert_eq!(service.metadata.namespace.as_deref(), Some(TEST_NAMESPACE));
        assert_eq!(
            spec.selector.unwrap().get("app").map(String::as_str),
            Some(CSI_ATTACHER_NAME)
        );
        assert_eq!(spec.ports.unwrap()[0].port, CSI_SERVICE_PORT);
    }

    #[test]
    fn test_sidecar_deployment_shape() {
        let attacher = AttacherDeployment::new(&options());
        let deployment = attacher.deployment();
        let annotations = deployment.metadata.annotations.clone().unwrap();
        let spec = deployment.spec.clone().unwrap();
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];

        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            annotations.get(CSI_VERSION_ANNOTATION).map(String::as_str),
            Some(env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(container.image.as_deref(), Some(DEFAULT_CSI_ATTACHER_IMAGE));
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&"--leader-election".to_string()));

        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "ADDRESS");
        assert_eq!(env[0].value.as_deref(), Some("/csi/csi.sock"));
        assert_eq!(
            env[1]
                .value_from
                .as_ref()
                .and_then(|v| v.field_ref.as_ref())
                .map(|f| f.field_path.as_str()),
            Some("metadata.namespace")
        );

        let volume = &pod.volumes.unwrap()[0];
        let host_path = volume.host_path.as_ref().unwrap();
        assert_eq!(
            host_path.path,
            "/var/lib/kubelet/plugins/driver.storage.firestoned.io"
        );
        assert_eq!(host_path.type_.as_deref(), Some("DirectoryOrCreate"));
    }

    #[test]
    fn test_kubernetes_version_is_annotated_when_known() {
        let opts = CsiOptions {
            kubernetes_version: Some("v1.31.2".into()),
            ..options()
        };
        let provisioner = ProvisionerDeployment::new(&opts);
        let annotations = provisioner.service().metadata.annotations.clone().unwrap();

        assert_eq!(
            annotations
                .get(KUBERNETES_VERSION_ANNOTATION)
                .map(String::as_str),
            Some("v1.31.2")
        );
    }

    #[test]
    fn test_plugin_daemon_set_is_privileged() {
        let plugin = PluginDeployment::new(&options());
        let pod = plugin
            .daemon_set()
            .spec
            .clone()
            .unwrap()
            .template
            .spec
            .unwrap();

        assert_eq!(pod.containers.len(), 2);
        let registrar = &pod.containers[0];
        let driver = &pod.containers[1];

        assert_eq!(registrar.name, "node-driver-registrar");
        assert!(registrar.args.as_ref().unwrap().contains(
            &"--kubelet-registration-path=/var/lib/kubelet/plugins/driver.storage.firestoned.io/csi.sock"
                .to_string()
        ));

        let security = driver.security_context.as_ref().unwrap();
        assert_eq!(security.privileged, Some(true));
        assert_eq!(security.allow_privilege_escalation, Some(true));
        assert_eq!(
            security.capabilities.as_ref().unwrap().add,
            Some(vec!["SYS_ADMIN".to_string()])
        );
        assert!(driver.lifecycle.as_ref().unwrap().pre_stop.is_some());

        let mounts = driver.volume_mounts.as_ref().unwrap();
        let plugin_dir = mounts.iter().find(|m| m.name == "plugin-dir").unwrap();
        assert_eq!(plugin_dir.mount_propagation.as_deref(), Some("Bidirectional"));
        let modules = mounts.iter().find(|m| m.name == "lib-modules").unwrap();
        assert_eq!(modules.read_only, Some(true));

        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 7);
        let registration = volumes.iter().find(|v| v.name == "registration-dir").unwrap();
        assert_eq!(
            registration.host_path.as_ref().unwrap().path,
            "/var/lib/kubelet/plugins_registry"
        );
    }

    #[tokio::test]
    async fn test_unit_object_sets_list_objects_in_deploy_order() {
        let server = MockServer::start().await;
        let client = mock_client(&server);
        let opts = options();

        let attacher = AttacherDeployment::new(&opts).object_set(&client).unwrap();
        assert_eq!(attacher.len(), 2);
        assert_eq!(attacher.name(), "attacher deployment");

        let plugin = PluginDeployment::new(&opts).object_set(&client).unwrap();
        assert_eq!(plugin.len(), 1);
    }

    #[tokio::test]
    async fn test_unit_without_namespace_fails_to_build() {
        let server = MockServer::start().await;
        let client = mock_client(&server);
        let opts = CsiOptions::new("", "image", "url");
        let unit = ProvisionerDeployment::new(&opts);

        assert!(unit.object_set(&client).is_err());

        let report = unit.cleanup(&client).await;
        assert_eq!(report.failed, vec!["provisioner deployment".to_string()]);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_attacher_deploy_creates_service_then_deployment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{SERVICES_PATH}/{CSI_ATTACHER_NAME}")))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DEPLOYMENTS_PATH}/{CSI_ATTACHER_NAME}")))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(ResponseTemplate::new(201).set_body_json(object_body(
                "v1",
                "Service",
                CSI_ATTACHER_NAME,
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(DEPLOYMENTS_PATH))
            .respond_with(ResponseTemplate::new(201).set_body_json(object_body(
                "apps/v1",
                "Deployment",
                CSI_ATTACHER_NAME,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let client = mock_client(&server);
        AttacherDeployment::new(&options())
            .deploy(&client)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap_or_default();
        let posts: Vec<String> = requests
            .iter()
            .filter(|r| r.method.as_str() == "POST")
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(posts, vec![SERVICES_PATH.to_string(), DEPLOYMENTS_PATH.to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_of_absent_unit_is_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;

        let client = mock_client(&server);
        let report = AttacherDeployment::new(&options()).cleanup(&client).await;

        assert!(report.is_complete());
        assert_eq!(report.removed.len(), 2);
    }
}
