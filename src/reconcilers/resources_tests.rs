// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `resources.rs`

#[cfg(test)]
mod tests {
    use super::super::{cleanup, deploy, KubeObject, ManagedObject};
    use crate::errors::ObjectError;
    use crate::test_support::{mock_client, object_body, status_body, TEST_NAMESPACE};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERVICES_PATH: &str = "/api/v1/namespaces/storage-system/services";
    const SERVICE_PATH: &str = "/api/v1/namespaces/storage-system/services/csi-attacher";

    /// How a scripted operation should answer
    #[derive(Clone, Copy)]
    enum Answer {
        Ok,
        Race,
        Fail,
    }

    /// In-memory object that records every call made against it
    struct ScriptedObject {
        present: Mutex<bool>,
        create: Answer,
        delete: Answer,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedObject {
        fn new(present: bool, create: Answer, delete: Answer) -> Self {
            Self {
                present: Mutex::new(present),
                create,
                delete,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn error(&self, operation: &'static str, answer: Answer) -> ObjectError {
            match (operation, answer) {
                ("create", Answer::Race) => ObjectError::AlreadyExists {
                    kind: "Service".into(),
                    namespace: TEST_NAMESPACE.into(),
                    name: "scripted".into(),
                },
                ("delete", Answer::Race) => ObjectError::NotFound {
                    kind: "Service".into(),
                    namespace: TEST_NAMESPACE.into(),
                    name: "scripted".into(),
                },
                _ => ObjectError::Api {
                    operation,
                    kind: "Service".into(),
                    namespace: TEST_NAMESPACE.into(),
                    name: "scripted".into(),
                    source: anyhow::anyhow!("scripted failure"),
                },
            }
        }
    }

    #[async_trait]
    impl ManagedObject for ScriptedObject {
        fn kind(&self) -> &str {
            "Service"
        }

        fn namespace(&self) -> &str {
            TEST_NAMESPACE
        }

        fn name(&self) -> &str {
            "scripted"
        }

        async fn get(&self) -> Result<bool, ObjectError> {
            self.calls.lock().unwrap().push("get");
            Ok(*self.present.lock().unwrap())
        }

        async fn create(&self) -> Result<(), ObjectError> {
            self.calls.lock().unwrap().push("create");
            match self.create {
                Answer::Ok => {
                    *self.present.lock().unwrap() = true;
                    Ok(())
                }
                answer => Err(self.error("create", answer)),
            }
        }

        async fn delete(&self) -> Result<(), ObjectError> {
            self.calls.lock().unwrap().push("delete");
            match self.delete {
                Answer::Ok => {
                    *self.present.lock().unwrap() = false;
                    Ok(())
                }
                answer => Err(self.error("delete", answer)),
            }
        }
    }

    fn attacher_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("csi-attacher".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deploy_creates_missing_object() {
        let object = ScriptedObject::new(false, Answer::Ok, Answer::Ok);

        deploy(&object).await.expect("deploy should succeed");

        assert_eq!(object.calls(), vec!["get", "create"]);
    }

    #[tokio::test]
    async fn test_deploy_skips_existing_object() {
        let object = ScriptedObject::new(true, Answer::Fail, Answer::Ok);

        deploy(&object).await.expect("existing object is already deployed");

        assert_eq!(object.calls(), vec!["get"], "create must not be called");
    }

    #[tokio::test]
    async fn test_deploy_treats_create_race_as_success() {
        let object = ScriptedObject::new(false, Answer::Race, Answer::Ok);

        deploy(&object)
            .await
            .expect("AlreadyExists from create is a benign race");
    }

    #[tokio::test]
    async fn test_deploy_propagates_create_failure() {
        let object = ScriptedObject::new(false, Answer::Fail, Answer::Ok);

        let err = deploy(&object).await.expect_err("create failure must surface");

        assert!(matches!(err, ObjectError::Api { operation: "create", .. }));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_present_object() {
        let object = ScriptedObject::new(true, Answer::Ok, Answer::Ok);

        cleanup(&object).await.expect("cleanup should succeed");

        assert_eq!(object.calls(), vec!["get", "delete"]);
    }

    #[tokio::test]
    async fn test_cleanup_skips_absent_object() {
        let object = ScriptedObject::new(false, Answer::Ok, Answer::Fail);

        cleanup(&object).await.expect("absent object is already cleaned up");

        assert_eq!(object.calls(), vec!["get"], "delete must not be called");
    }

    #[tokio::test]
    async fn test_cleanup_treats_delete_race_as_success() {
        let object = ScriptedObject::new(true, Answer::Ok, Answer::Race);

        cleanup(&object)
            .await
            .expect("NotFound from delete is a benign race");
    }

    #[tokio::test]
    async fn test_cleanup_reports_delete_failure() {
        let object = ScriptedObject::new(true, Answer::Ok, Answer::Fail);

        let err = cleanup(&object).await.expect_err("delete failure must be reported");

        assert!(matches!(err, ObjectError::Api { operation: "delete", .. }));
    }

    #[tokio::test]
    async fn test_kube_object_requires_name_and_namespace() {
        let server_uri = "http://127.0.0.1:1";
        let client = kube::Client::try_from(kube::Config::new(server_uri.parse().unwrap()))
            .expect("client should build without connecting");

        let err = KubeObject::new(&client, Service::default())
            .err()
            .expect("unnamed object must be rejected");

        assert!(matches!(err, ObjectError::Api { operation: "build", .. }));
    }

    #[tokio::test]
    async fn test_kube_object_deploys_missing_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICE_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(object_body("v1", "Service", "csi-attacher")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let object = KubeObject::new(&mock_client(&server), attacher_service()).unwrap();
        assert_eq!(object.kind(), "Service");

        deploy(&object).await.expect("deploy should create the service");
    }

    #[tokio::test]
    async fn test_kube_object_retries_unavailable_create_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(status_body(503, "ServiceUnavailable")),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(object_body("v1", "Service", "csi-attacher")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SERVICE_PATH))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(status_body(503, "ServiceUnavailable")),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SERVICE_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(object_body("v1", "Service", "csi-attacher")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let object = KubeObject::new(&mock_client(&server), attacher_service()).unwrap();

        object.create().await.expect("create should be retried");
        object.delete().await.expect("delete should be retried");
    }

    #[tokio::test]
    async fn test_kube_object_maps_conflict_to_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICE_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(status_body(409, "AlreadyExists")),
            )
            .mount(&server)
            .await;

        let object = KubeObject::new(&mock_client(&server), attacher_service()).unwrap();

        let err = object.create().await.expect_err("409 should surface from create");
        assert!(err.is_already_exists());
        deploy(&object)
            .await
            .expect("deploy should swallow the create race");
    }

    #[tokio::test]
    async fn test_kube_object_cleanup_swallows_not_found_on_delete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICE_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(object_body("v1", "Service", "csi-attacher")),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SERVICE_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .expect(1)
            .mount(&server)
            .await;

        let object = KubeObject::new(&mock_client(&server), attacher_service()).unwrap();

        cleanup(&object)
            .await
            .expect("NotFound on delete should be treated as cleaned up");
    }

    #[tokio::test]
    async fn test_kube_object_propagates_forbidden_create() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICE_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SERVICES_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_json(status_body(403, "Forbidden")))
            .mount(&server)
            .await;

        let object = KubeObject::new(&mock_client(&server), attacher_service()).unwrap();

        let err = deploy(&object).await.expect_err("403 must not be swallowed");
        assert!(err.to_string().contains("failed to create Service storage-system/csi-attacher"));
    }
}
