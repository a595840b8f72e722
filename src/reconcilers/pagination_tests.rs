// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `pagination.rs`

#[cfg(test)]
mod tests {
    use super::super::list_all_paginated;
    use crate::test_support::{mock_client, status_body, TEST_NAMESPACE};
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ListParams;
    use kube::Api;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PODS_PATH: &str = "/api/v1/namespaces/storage-system/pods";

    fn pod_list(names: &[&str], continue_token: Option<&str>) -> Value {
        let items: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": { "name": name, "namespace": TEST_NAMESPACE }
                })
            })
            .collect();
        let mut metadata = json!({ "resourceVersion": "10" });
        if let Some(token) = continue_token {
            metadata["continue"] = Value::String(token.to_string());
        }
        json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": metadata,
            "items": items
        })
    }

    #[tokio::test]
    async fn test_follows_continue_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PODS_PATH))
            .and(query_param("continue", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(&["pod-c"], None)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(PODS_PATH))
            .and(query_param("limit", "100"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(pod_list(&["pod-a", "pod-b"], Some("page-2"))),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let api: Api<Pod> = Api::namespaced(mock_client(&server), TEST_NAMESPACE);
        let pods = list_all_paginated(&api, ListParams::default()).await.unwrap();

        let names: Vec<_> = pods
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        assert_eq!(names, vec!["pod-a", "pod-b", "pod-c"]);
    }

    #[tokio::test]
    async fn test_forbidden_list_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PODS_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_json(status_body(403, "Forbidden")))
            .mount(&server)
            .await;

        let api: Api<Pod> = Api::namespaced(mock_client(&server), TEST_NAMESPACE);
        let err = list_all_paginated(&api, ListParams::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cannot list Pod"));
    }
}
