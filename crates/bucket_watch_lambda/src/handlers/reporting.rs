use bucket_watch_core::report::{render_svg, ReportSeries};
use bucket_watch_core::storage_keys::{object_url, report_object_key, REPORT_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapters::aggregation_table::AggregationTable;
use crate::adapters::object_store::ObjectStore;
use crate::config::ReportingConfig;
use crate::telemetry::{log_error, log_info};

const COMPONENT: &str = "reporting";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

impl ApiGatewayResponse {
    pub fn body_json(&self) -> Result<Value, String> {
        serde_json::from_str(&self.body)
            .map_err(|error| format!("response body is not JSON: {error}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportResponse {
    pub status: String,
    pub artifact_key: String,
    pub artifact_url: String,
    pub points: usize,
    pub peak_total: u64,
}

/// Renders the bucket's recent size history and stores the chart in the
/// bucket. The optional `lookback_secs` query parameter overrides the
/// configured window; 0 means the whole history.
pub fn handle_report_request(
    event: &Value,
    config: &ReportingConfig,
    now_ms: i64,
    table: &dyn AggregationTable,
    store: &dyn ObjectStore,
) -> ApiGatewayResponse {
    let lookback_secs = match requested_lookback(event) {
        Ok(value) => value.unwrap_or(config.lookback_secs),
        Err(message) => {
            return error_response(
                400,
                json!({
                    "error": "validation_error",
                    "message": message,
                }),
            )
        }
    };

    match build_report(config, lookback_secs, now_ms, table, store) {
        Ok(response) => {
            log_info(
                COMPONENT,
                "report_written",
                json!({
                    "artifact_key": response.artifact_key,
                    "points": response.points,
                    "peak_total": response.peak_total,
                }),
            );
            success_response(200, &response)
        }
        Err(error) => {
            log_error(
                COMPONENT,
                "report_failed",
                json!({"bucket": config.bucket, "error": error}),
            );
            error_response(500, json!({"error": "internal_error"}))
        }
    }
}

fn build_report(
    config: &ReportingConfig,
    lookback_secs: i64,
    now_ms: i64,
    table: &dyn AggregationTable,
    store: &dyn ObjectStore,
) -> Result<ReportResponse, String> {
    let since_ms = if lookback_secs == 0 {
        i64::MIN
    } else {
        now_ms.saturating_sub(lookback_secs.saturating_mul(1_000))
    };
    let records = table.query_store(&config.bucket, since_ms)?;
    let peak_total = table
        .peak_record(&config.record_type, &config.bucket)?
        .map(|record| record.total_size);

    let series = ReportSeries::from_records(config.bucket.clone(), &records, peak_total);
    let svg = render_svg(&series);
    let artifact_key = report_object_key(&config.prefix);
    store.put_object(&artifact_key, svg.as_bytes(), Some(REPORT_CONTENT_TYPE))?;

    Ok(ReportResponse {
        status: "ok".to_string(),
        artifact_url: object_url(store.bucket(), &artifact_key),
        artifact_key,
        points: series.points.len(),
        peak_total: series.peak_total,
    })
}

fn requested_lookback(event: &Value) -> Result<Option<i64>, String> {
    let Some(raw) = event
        .get("queryStringParameters")
        .and_then(|parameters| parameters.get("lookback_secs"))
    else {
        return Ok(None);
    };

    let parsed = match raw {
        Value::Null => return Ok(None),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("lookback_secs must be an integer, got '{text}'"))?,
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| "lookback_secs must be an integer".to_string())?,
        _ => return Err("lookback_secs must be an integer".to_string()),
    };

    if parsed < 0 {
        return Err("lookback_secs must not be negative".to_string());
    }
    Ok(Some(parsed))
}

pub(crate) fn success_response(status_code: u16, payload: &impl Serialize) -> ApiGatewayResponse {
    match serde_json::to_string(payload) {
        Ok(body) => ApiGatewayResponse {
            status_code,
            headers: json!({"Content-Type": "application/json"}),
            body,
        },
        Err(_) => error_response(500, json!({"error": "internal_error"})),
    }
}

pub(crate) fn error_response(status_code: u16, payload: Value) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: payload.to_string(),
    }
}
