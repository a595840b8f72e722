// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared helpers for unit tests that talk to a mocked Kubernetes API server.

use kube::Client;
use serde_json::{json, Value};
use wiremock::MockServer;

/// Namespace used by tests that need one
pub(crate) const TEST_NAMESPACE: &str = "storage-system";

/// Build a client pointed at a wiremock server.
pub(crate) fn mock_client(server: &MockServer) -> Client {
    let config = kube::Config::new(server.uri().parse().expect("mock server uri should parse"));
    Client::try_from(config).expect("client for mock server should build")
}

/// A Kubernetes `Status` failure body as returned by the API server.
pub(crate) fn status_body(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("request failed: {reason}"),
        "reason": reason,
        "code": code
    })
}

/// Minimal object body for a namespaced core or apps object.
pub(crate) fn object_body(api_version: &str, kind: &str, name: &str) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": TEST_NAMESPACE,
            "resourceVersion": "1"
        }
    })
}
