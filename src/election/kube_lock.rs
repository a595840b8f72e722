// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Lease storage backed by a `coordination.k8s.io/v1` `Lease`.
//!
//! Updates are full replaces carrying the `resourceVersion` that was read, so
//! the API server rejects a stale write with 409 and two candidates can never
//! both believe they won the same round.

use super::lock::{LeaseLock, LeaseRecord, VersionedRecord};
use crate::errors::LeaseError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::PostParams;
use kube::{Api, Client};
use serde_json::{json, Value};
use std::time::Duration;

/// [`LeaseLock`] implementation over a Kubernetes `Lease` object.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    /// Lease `name` in `namespace`.
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Build the `Lease` object for a record.
    ///
    /// Goes through JSON so the wire format of `MicroTime` is the one the API
    /// server expects regardless of the time crate behind `k8s-openapi`.
    fn encode(&self, record: &LeaseRecord, resource_version: Option<&str>) -> Result<Lease, LeaseError> {
        let mut metadata = json!({
            "name": self.name,
            "namespace": self.namespace,
        });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = Value::String(rv.to_string());
        }

        let mut spec = json!({
            "leaseDurationSeconds": i64::try_from(record.lease_duration.as_secs()).unwrap_or(i64::MAX),
            "leaseTransitions": record.lease_transitions,
        });
        if let Some(holder) = record.holder() {
            spec["holderIdentity"] = Value::String(holder.to_string());
        }
        if let Some(t) = record.acquire_time {
            spec["acquireTime"] = Value::String(micro_time(t));
        }
        if let Some(t) = record.renew_time {
            spec["renewTime"] = Value::String(micro_time(t));
        }

        serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": spec,
        }))
        .map_err(|e| self.malformed(format!("cannot encode lease: {e}")))
    }

    /// Read a `Lease` object back into a record.
    fn decode(&self, lease: &Lease) -> Result<VersionedRecord, LeaseError> {
        let resource_version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| self.malformed("missing resourceVersion".to_string()))?;

        let spec = serde_json::to_value(&lease.spec)
            .map_err(|e| self.malformed(format!("cannot decode lease spec: {e}")))?;

        let lease_duration = spec
            .get("leaseDurationSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or_default();
        let lease_transitions = spec
            .get("leaseTransitions")
            .and_then(Value::as_i64)
            .and_then(|t| i32::try_from(t).ok())
            .unwrap_or_default();

        Ok(VersionedRecord {
            record: LeaseRecord {
                holder_identity: spec
                    .get("holderIdentity")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                lease_duration,
                acquire_time: self.parse_time(&spec, "acquireTime")?,
                renew_time: self.parse_time(&spec, "renewTime")?,
                lease_transitions,
            },
            resource_version,
        })
    }

    fn parse_time(&self, spec: &Value, field: &str) -> Result<Option<DateTime<Utc>>, LeaseError> {
        match spec.get(field).and_then(Value::as_str) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| self.malformed(format!("invalid {field} {raw:?}: {e}"))),
        }
    }

    fn malformed(&self, reason: String) -> LeaseError {
        LeaseError::Malformed {
            name: self.name.clone(),
            reason,
        }
    }

    fn backend(&self, err: kube::Error) -> LeaseError {
        LeaseError::Backend {
            name: self.name.clone(),
            source: err.into(),
        }
    }

    fn stored_version(&self, lease: &Lease) -> Result<String, LeaseError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| self.malformed("API server returned no resourceVersion".to_string()))
    }
}

fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
        match self.api.get_opt(&self.name).await {
            Ok(Some(lease)) => self.decode(&lease).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.backend(e)),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<String, LeaseError> {
        let lease = self.encode(record, None)?;
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(created) => self.stored_version(&created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(LeaseError::AlreadyExists {
                name: self.name.clone(),
            }),
            Err(e) => Err(self.backend(e)),
        }
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        resource_version: &str,
    ) -> Result<String, LeaseError> {
        let lease = self.encode(record, Some(resource_version))?;
        match self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(updated) => self.stored_version(&updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {
                Err(LeaseError::Conflict {
                    name: self.name.clone(),
                })
            }
            Err(e) => Err(self.backend(e)),
        }
    }
}

#[cfg(test)]
#[path = "kube_lock_tests.rs"]
mod kube_lock_tests;
