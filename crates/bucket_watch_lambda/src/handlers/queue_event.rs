//! Lambda SQS event source shape.

use serde_json::Value;

use super::HandlerError;

pub fn is_sqs_event(event: &Value) -> bool {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            !records.is_empty()
                && records.iter().all(|record| {
                    record
                        .get("eventSource")
                        .and_then(Value::as_str)
                        .map(|source| source == "aws:sqs")
                        .unwrap_or(false)
                })
        })
        .unwrap_or(false)
}

/// Message bodies of an SQS batch, in delivery order.
pub fn decode_sqs_bodies(event: &Value) -> Result<Vec<String>, HandlerError> {
    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| HandlerError::new("SQS event must include Records array"))?;

    records
        .iter()
        .map(|record| {
            record
                .get("body")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| HandlerError::new("SQS record body must be a string"))
        })
        .collect()
}
