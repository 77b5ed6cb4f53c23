use bucket_watch_core::contract::{ChangeEvent, ChangeKind, SizeLogRecord};
use bucket_watch_core::notification::decode_queue_body;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::HandlerError;
use crate::adapters::log_store::LogStore;
use crate::telemetry::{log_error, log_warn};

const COMPONENT: &str = "logging";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSummary {
    pub messages: usize,
    pub written: usize,
    pub duplicates: usize,
    pub unresolved_removals: usize,
}

/// Writes one size log record per change event at `now_ms`.
///
/// A removal carries no size, so its delta is the negation of the object's
/// latest creation record; when none is found the delta is 0.
pub fn handle_logging_batch(
    bodies: &[String],
    logs: &dyn LogStore,
    now_ms: i64,
) -> Result<LoggingSummary, HandlerError> {
    let mut summary = LoggingSummary {
        messages: bodies.len(),
        ..LoggingSummary::default()
    };

    for body in bodies {
        let events = decode_queue_body(body).map_err(|error| {
            log_error(
                COMPONENT,
                "decode_failed",
                json!({"error": error.message()}),
            );
            HandlerError::from(error)
        })?;

        for event in events {
            let event_id = event.event_id();
            if logs.contains_event(&event_id)? {
                summary.duplicates += 1;
                continue;
            }

            let size_delta = match size_delta_for(&event, logs)? {
                Some(delta) => delta,
                None => {
                    log_warn(
                        COMPONENT,
                        "creation_size_not_found",
                        json!({"store_id": event.store_id, "object_key": event.object_key}),
                    );
                    summary.unresolved_removals += 1;
                    0
                }
            };

            let record = SizeLogRecord {
                object_name: event.object_key.clone(),
                size_delta,
                event_id: Some(event_id),
                store_id: Some(event.store_id.clone()),
            };
            logs.write(&record, now_ms).map_err(|error| {
                log_error(
                    COMPONENT,
                    "write_failed",
                    json!({"object_key": event.object_key, "error": error}),
                );
                HandlerError::new(error)
            })?;
            summary.written += 1;
        }
    }

    Ok(summary)
}

fn size_delta_for(event: &ChangeEvent, logs: &dyn LogStore) -> Result<Option<i64>, HandlerError> {
    match event.event_type {
        ChangeKind::Created => {
            let size = event.size.ok_or_else(|| {
                HandlerError::new(format!("created event for '{}' has no size", event.object_key))
            })?;
            let size = i64::try_from(size)
                .map_err(|_| HandlerError::new("object size exceeds i64 range"))?;
            Ok(Some(size))
        }
        ChangeKind::Removed => {
            let Some(size) = logs.find_creation_size(&event.object_key)? else {
                return Ok(None);
            };
            let size = i64::try_from(size)
                .map_err(|_| HandlerError::new("object size exceeds i64 range"))?;
            Ok(Some(-size))
        }
    }
}
