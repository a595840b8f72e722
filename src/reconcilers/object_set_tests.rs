// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `object_set.rs`

#[cfg(test)]
mod tests {
    use super::super::ObjectSet;
    use crate::errors::ObjectError;
    use crate::reconcilers::resources::ManagedObject;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shared view of a fake object so tests can inspect it after the set takes ownership
    #[derive(Default)]
    struct FakeState {
        present: AtomicBool,
        creates: AtomicUsize,
        deletes: AtomicUsize,
    }

    struct FakeObject {
        name: &'static str,
        state: Arc<FakeState>,
        fail_create: bool,
        fail_delete: bool,
    }

    impl FakeObject {
        fn new(name: &'static str, present: bool) -> (Self, Arc<FakeState>) {
            let state = Arc::new(FakeState::default());
            state.present.store(present, Ordering::SeqCst);
            (
                Self {
                    name,
                    state: state.clone(),
                    fail_create: false,
                    fail_delete: false,
                },
                state,
            )
        }

        fn failing_create(mut self) -> Self {
            self.fail_create = true;
            self
        }

        fn failing_delete(mut self) -> Self {
            self.fail_delete = true;
            self
        }

        fn failure(&self, operation: &'static str) -> ObjectError {
            ObjectError::Api {
                operation,
                kind: "Deployment".into(),
                namespace: "storage-system".into(),
                name: self.name.into(),
                source: anyhow::anyhow!("injected {operation} failure"),
            }
        }
    }

    #[async_trait]
    impl ManagedObject for FakeObject {
        fn kind(&self) -> &str {
            "Deployment"
        }

        fn namespace(&self) -> &str {
            "storage-system"
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn get(&self) -> Result<bool, ObjectError> {
            Ok(self.state.present.load(Ordering::SeqCst))
        }

        async fn create(&self) -> Result<(), ObjectError> {
            self.state.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(self.failure("create"));
            }
            self.state.present.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self) -> Result<(), ObjectError> {
            self.state.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                return Err(self.failure("delete"));
            }
            self.state.present.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deploy_creates_objects_in_order() {
        let (service, service_state) = FakeObject::new("csi-attacher", false);
        let (deployment, deployment_state) = FakeObject::new("csi-attacher-deploy", false);
        let set = ObjectSet::new("attacher deployment")
            .with(service)
            .with(deployment);

        set.deploy().await.expect("deploy should succeed");

        assert!(service_state.present.load(Ordering::SeqCst));
        assert!(deployment_state.present.load(Ordering::SeqCst));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_deploy_stops_at_first_failure_and_keeps_earlier_objects() {
        let (first, first_state) = FakeObject::new("first", false);
        let (second, second_state) = FakeObject::new("second", false);
        let (third, third_state) = FakeObject::new("third", false);
        let set = ObjectSet::new("unit")
            .with(first)
            .with(second.failing_create())
            .with(third);

        let err = set.deploy().await.expect_err("second create must fail the set");

        assert!(matches!(err, ObjectError::Api { operation: "create", .. }));
        assert!(
            first_state.present.load(Ordering::SeqCst),
            "earlier objects are not rolled back"
        );
        assert!(!second_state.present.load(Ordering::SeqCst));
        assert_eq!(
            third_state.creates.load(Ordering::SeqCst),
            0,
            "objects after the failure are never attempted"
        );
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let (first, first_state) = FakeObject::new("first", true);
        let (second, second_state) = FakeObject::new("second", true);
        let set = ObjectSet::new("unit")
            .with(first.failing_delete())
            .with(second);

        let report = set.cleanup().await;

        assert_eq!(report.failed, vec!["Deployment/first".to_string()]);
        assert_eq!(report.removed, vec!["Deployment/second".to_string()]);
        assert!(!report.is_complete());
        assert!(first_state.present.load(Ordering::SeqCst));
        assert!(!second_state.present.load(Ordering::SeqCst));
        assert_eq!(first_state.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_of_absent_objects_is_complete() {
        let (first, first_state) = FakeObject::new("first", false);
        let (second, _) = FakeObject::new("second", false);
        let set = ObjectSet::new("unit").with(first).with(second);

        let report = set.cleanup().await;

        assert!(report.is_complete());
        assert_eq!(report.removed.len(), 2);
        assert_eq!(first_state.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_set_is_a_no_op() {
        let set = ObjectSet::new("empty");

        assert!(set.is_empty());
        set.deploy().await.expect("empty deploy succeeds");
        assert!(set.cleanup().await.is_complete());
    }
}
