//! Queue message bodies carrying object-store notifications.
//!
//! A queue subscribed to the topic receives the topic envelope, whose
//! `Message` field is the store's notification document as a JSON string.
//! Raw notification documents (raw message delivery) are accepted too, and the
//! store's test notification decodes to no events.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{ChangeEvent, ChangeKind, ValidationError};

const CREATED_PREFIX: &str = "ObjectCreated";
const REMOVED_PREFIX: &str = "ObjectRemoved";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "MessageId", default)]
    pub message_id: String,
    #[serde(rename = "TopicArn", default)]
    pub topic_arn: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreNotification {
    #[serde(rename = "Records")]
    pub records: Vec<StoreRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreRecord {
    #[serde(rename = "eventSource", default)]
    pub event_source: String,
    #[serde(rename = "eventTime")]
    pub event_time: String,
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: StoreEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectEntity {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<String>,
}

/// Decodes one queue message body into zero or more change events.
pub fn decode_queue_body(body: &str) -> Result<Vec<ChangeEvent>, ValidationError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| ValidationError::new(format!("queue body is not JSON: {error}")))?;

    let document = match value.get("Message").and_then(Value::as_str) {
        Some(message) => serde_json::from_str::<Value>(message).map_err(|error| {
            ValidationError::new(format!("topic message is not JSON: {error}"))
        })?,
        None => value,
    };

    decode_store_document(document)
}

fn decode_store_document(document: Value) -> Result<Vec<ChangeEvent>, ValidationError> {
    if document.get("Records").is_none() {
        if is_test_notification(&document) {
            return Ok(Vec::new());
        }
        return Err(ValidationError::new(
            "store notification must include a Records array",
        ));
    }

    let notification: StoreNotification = serde_json::from_value(document)
        .map_err(|error| ValidationError::new(format!("malformed store notification: {error}")))?;

    let mut events = Vec::with_capacity(notification.records.len());
    for record in notification.records {
        if let Some(event) = decode_record(record)? {
            events.push(event);
        }
    }
    Ok(events)
}

fn is_test_notification(document: &Value) -> bool {
    document
        .get("Event")
        .and_then(Value::as_str)
        .map(|event| event.ends_with("TestEvent"))
        .unwrap_or(false)
}

fn decode_record(record: StoreRecord) -> Result<Option<ChangeEvent>, ValidationError> {
    let event_type = if record.event_name.starts_with(CREATED_PREFIX) {
        ChangeKind::Created
    } else if record.event_name.starts_with(REMOVED_PREFIX) {
        ChangeKind::Removed
    } else {
        return Ok(None);
    };

    let timestamp_ms = DateTime::parse_from_rfc3339(&record.event_time)
        .map_err(|error| {
            ValidationError::new(format!(
                "invalid eventTime '{}': {error}",
                record.event_time
            ))
        })?
        .timestamp_millis();

    let size = match event_type {
        ChangeKind::Created => Some(record.s3.object.size.ok_or_else(|| {
            ValidationError::new(format!(
                "created event for '{}' is missing object size",
                record.s3.object.key
            ))
        })?),
        ChangeKind::Removed => None,
    };

    Ok(Some(ChangeEvent {
        store_id: record.s3.bucket.name,
        object_key: decode_object_key(&record.s3.object.key)?,
        event_type,
        size,
        timestamp_ms,
        sequencer: record.s3.object.sequencer,
    }))
}

/// Notification keys are form-encoded: `+` is a space and `%XX` an escaped byte.
fn decode_object_key(raw: &str) -> Result<String, ValidationError> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|_| ValidationError::new(format!("object key '{raw}' is not UTF-8")))
}

fn encode_object_key(key: &str) -> String {
    urlencoding::encode(key).replace("%20", "+")
}

/// Builds the topic envelope a queue would receive for `event`.
pub fn encode_topic_message(event: &ChangeEvent, message_id: &str) -> Result<String, String> {
    let event_time = Utc
        .timestamp_millis_opt(event.timestamp_ms)
        .single()
        .ok_or_else(|| format!("timestamp {} is out of range", event.timestamp_ms))?
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    let event_name = match event.event_type {
        ChangeKind::Created => "ObjectCreated:Put",
        ChangeKind::Removed => "ObjectRemoved:Delete",
    };

    let notification = StoreNotification {
        records: vec![StoreRecord {
            event_source: "aws:s3".to_string(),
            event_time: event_time.clone(),
            event_name: event_name.to_string(),
            s3: StoreEntity {
                bucket: BucketEntity {
                    name: event.store_id.clone(),
                },
                object: ObjectEntity {
                    key: encode_object_key(&event.object_key),
                    size: event.size,
                    sequencer: event.sequencer.clone(),
                },
            },
        }],
    };
    let message = serde_json::to_string(&notification)
        .map_err(|error| format!("failed to serialize store notification: {error}"))?;

    serde_json::to_string(&TopicEnvelope {
        kind: "Notification".to_string(),
        message_id: message_id.to_string(),
        topic_arn: format!("local:topic:{}", event.store_id),
        message,
        timestamp: event_time,
    })
    .map_err(|error| format!("failed to serialize topic envelope: {error}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn wrapped(document: Value) -> String {
        json!({
            "Type": "Notification",
            "MessageId": "m-1",
            "TopicArn": "arn:aws:sns:us-east-1:123:topic",
            "Message": document.to_string(),
        })
        .to_string()
    }

    #[test]
    fn decodes_created_event_from_topic_envelope() {
        let body = wrapped(json!({
            "Records": [{
                "eventSource": "aws:s3",
                "eventTime": "2026-02-14T10:00:05.250Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": {"name": "watch-bucket"},
                    "object": {"key": "assignment1.txt", "size": 19, "sequencer": "0A1"}
                }
            }]
        }));

        let events = decode_queue_body(&body).expect("body should decode");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.store_id, "watch-bucket");
        assert_eq!(event.object_key, "assignment1.txt");
        assert_eq!(event.event_type, ChangeKind::Created);
        assert_eq!(event.size, Some(19));
        assert_eq!(event.sequencer.as_deref(), Some("0A1"));
        assert_eq!(event.timestamp_ms % 1_000, 250);
    }

    #[test]
    fn decodes_removed_event_without_size() {
        let body = json!({
            "Records": [{
                "eventTime": "2026-02-14T10:00:05Z",
                "eventName": "ObjectRemoved:Delete",
                "s3": {
                    "bucket": {"name": "watch-bucket"},
                    "object": {"key": "my+report%281%29.txt"}
                }
            }]
        })
        .to_string();

        let events = decode_queue_body(&body).expect("raw notification should decode");
        assert_eq!(events[0].event_type, ChangeKind::Removed);
        assert_eq!(events[0].size, None);
        assert_eq!(events[0].object_key, "my report(1).txt");
    }

    #[test]
    fn stray_percent_sign_is_kept_literally() {
        let body = json!({
            "Records": [{
                "eventTime": "2026-02-14T10:00:05Z",
                "eventName": "ObjectRemoved:Delete",
                "s3": {
                    "bucket": {"name": "watch-bucket"},
                    "object": {"key": "100%zz+done.txt"}
                }
            }]
        })
        .to_string();

        let events = decode_queue_body(&body).expect("malformed escape should not fail");
        assert_eq!(events[0].object_key, "100%zz done.txt");
    }

    #[test]
    fn test_notification_decodes_to_no_events() {
        let body = wrapped(json!({
            "Service": "Amazon S3",
            "Event": "s3:TestEvent",
            "Bucket": "watch-bucket"
        }));

        assert!(decode_queue_body(&body)
            .expect("test event should decode")
            .is_empty());
    }

    #[test]
    fn rejects_created_event_without_size() {
        let body = json!({
            "Records": [{
                "eventTime": "2026-02-14T10:00:05Z",
                "eventName": "ObjectCreated:Put",
                "s3": {"bucket": {"name": "b"}, "object": {"key": "a.txt"}}
            }]
        })
        .to_string();

        let error = decode_queue_body(&body).expect_err("missing size should fail");
        assert!(error.message().contains("missing object size"));
    }

    #[test]
    fn ignores_unrelated_event_names() {
        let body = json!({
            "Records": [{
                "eventTime": "2026-02-14T10:00:05Z",
                "eventName": "ObjectRestore:Completed",
                "s3": {"bucket": {"name": "b"}, "object": {"key": "a.txt"}}
            }]
        })
        .to_string();

        assert!(decode_queue_body(&body).expect("should decode").is_empty());
    }

    #[test]
    fn encoded_topic_message_decodes_to_same_event() {
        let event = ChangeEvent::created("watch-bucket", "dir/a b+c%.txt", 7, 1_771_063_205_250)
            .with_sequencer("00FF");
        let body = encode_topic_message(&event, "m-9").expect("should encode");

        let decoded = decode_queue_body(&body).expect("should decode");
        assert_eq!(decoded, vec![event]);
    }
}
