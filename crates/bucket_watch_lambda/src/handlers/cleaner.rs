use bucket_watch_core::cleanup::{plan_cleanup, CleanupPolicy};
use bucket_watch_core::contract::StoredObject;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::HandlerError;
use crate::adapters::object_store::ObjectStore;
use crate::telemetry::{log_error, log_info};

const COMPONENT: &str = "cleaner";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub status: String,
    pub bucket: String,
    pub deleted: Vec<StoredObject>,
    pub remaining_size: u64,
}

/// Deletes eligible objects, largest first, until the eligible total fits
/// the policy budget. A second run against the same bucket deletes nothing.
pub fn handle_cleanup(
    store: &dyn ObjectStore,
    policy: &CleanupPolicy,
) -> Result<CleanupResponse, HandlerError> {
    let objects = store.list_objects().map_err(|error| {
        log_error(
            COMPONENT,
            "list_failed",
            json!({"bucket": store.bucket(), "error": error}),
        );
        HandlerError::new(error)
    })?;
    let plan = plan_cleanup(&objects, policy);

    if plan.is_noop() {
        log_info(
            COMPONENT,
            "cleanup_skipped",
            json!({
                "bucket": store.bucket(),
                "eligible_size": plan.eligible_size_before,
                "size_budget": policy.size_budget,
            }),
        );
    }

    for object in &plan.delete {
        store.delete_object(&object.key).map_err(|error| {
            log_error(
                COMPONENT,
                "delete_failed",
                json!({"bucket": store.bucket(), "key": object.key, "error": error}),
            );
            HandlerError::new(error)
        })?;
        log_info(
            COMPONENT,
            "object_deleted",
            json!({"bucket": store.bucket(), "key": object.key, "size": object.size}),
        );
    }

    Ok(CleanupResponse {
        status: if plan.is_noop() { "noop" } else { "cleaned" }.to_string(),
        bucket: store.bucket().to_string(),
        deleted: plan.delete,
        remaining_size: plan.eligible_size_after,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    struct RecordingStore {
        objects: Mutex<BTreeMap<String, u64>>,
        deletes: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn with(objects: &[(&str, u64)]) -> Self {
            Self {
                objects: Mutex::new(
                    objects
                        .iter()
                        .map(|(key, size)| (key.to_string(), *size))
                        .collect(),
                ),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn deletes(&self) -> Vec<String> {
            self.deletes.lock().expect("poisoned mutex").clone()
        }
    }

    impl ObjectStore for RecordingStore {
        fn bucket(&self) -> &str {
            "watch-bucket"
        }

        fn put_object(&self, key: &str, body: &[u8], _: Option<&str>) -> Result<(), String> {
            self.objects
                .lock()
                .expect("poisoned mutex")
                .insert(key.to_string(), body.len() as u64);
            Ok(())
        }

        fn get_object(&self, _key: &str) -> Result<Option<Vec<u8>>, String> {
            Ok(None)
        }

        fn delete_object(&self, key: &str) -> Result<(), String> {
            self.deletes
                .lock()
                .expect("poisoned mutex")
                .push(key.to_string());
            self.objects.lock().expect("poisoned mutex").remove(key);
            Ok(())
        }

        fn list_objects(&self) -> Result<Vec<StoredObject>, String> {
            Ok(self
                .objects
                .lock()
                .expect("poisoned mutex")
                .iter()
                .map(|(key, size)| StoredObject {
                    key: key.clone(),
                    size: *size,
                })
                .collect())
        }
    }

    #[test]
    fn deletes_largest_first_until_within_budget() {
        let store = RecordingStore::with(&[
            ("assignment1.txt", 19),
            ("assignment2.txt", 28),
            ("assignment3.txt", 2),
            ("reports/plot.svg", 4_000),
        ]);

        let response = handle_cleanup(&store, &CleanupPolicy::default()).expect("cleanup");

        assert_eq!(store.deletes(), vec!["assignment2.txt", "assignment1.txt"]);
        assert_eq!(response.remaining_size, 2);
        assert_eq!(response.status, "cleaned");
    }

    #[test]
    fn second_run_is_noop() {
        let store = RecordingStore::with(&[("assignment1.txt", 19), ("assignment2.txt", 28)]);
        let policy = CleanupPolicy::default();

        handle_cleanup(&store, &policy).expect("first run");
        let second = handle_cleanup(&store, &policy).expect("second run");

        assert_eq!(second.status, "noop");
        assert!(second.deleted.is_empty());
        assert_eq!(store.deletes().len(), 1);
    }

    #[test]
    fn empty_bucket_is_noop() {
        let store = RecordingStore::with(&[]);
        let response = handle_cleanup(&store, &CleanupPolicy::default()).expect("cleanup");
        assert_eq!(response.status, "noop");
        assert_eq!(response.remaining_size, 0);
    }
}
