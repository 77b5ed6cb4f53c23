use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::reporting::{error_response, success_response, ApiGatewayResponse};
use crate::telemetry::{log_error, log_info};

const COMPONENT: &str = "driver";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DriverStep {
    Put { key: String, body: String },
    Delete { key: String },
    Wait { seconds: u64 },
    CallReport,
}

/// What a driver script can do to the running system.
pub trait DriverHarness {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), String>;
    fn delete_object(&self, key: &str) -> Result<(), String>;
    fn wait(&self, seconds: u64) -> Result<(), String>;
    fn call_report(&self) -> Result<ApiGatewayResponse, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub status: String,
    pub steps_run: usize,
    pub report: Option<Value>,
}

/// Three uploads whose running total crosses the alarm threshold, then a
/// report request.
pub fn default_script() -> Vec<DriverStep> {
    vec![
        DriverStep::Put {
            key: "assignment1.txt".to_string(),
            body: "Empty Assignment 01".to_string(),
        },
        DriverStep::Wait { seconds: 5 },
        DriverStep::Put {
            key: "assignment2.txt".to_string(),
            body: "Empty Assignment 22222222222".to_string(),
        },
        DriverStep::Wait { seconds: 10 },
        DriverStep::Put {
            key: "assignment3.txt".to_string(),
            body: "33".to_string(),
        },
        DriverStep::Wait { seconds: 10 },
        DriverStep::CallReport,
    ]
}

/// Runs the script carried in `event` (a `steps` array, directly or in an
/// API Gateway body) or the default script when there is none.
pub fn handle_driver_event(event: &Value, harness: &dyn DriverHarness) -> ApiGatewayResponse {
    let script = match script_from_event(event) {
        Ok(Some(steps)) => steps,
        Ok(None) => default_script(),
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
    run_driver(&script, harness)
}

pub fn run_driver(script: &[DriverStep], harness: &dyn DriverHarness) -> ApiGatewayResponse {
    let mut report = None;

    for (index, step) in script.iter().enumerate() {
        let outcome = match step {
            DriverStep::Put { key, body } => harness.put_object(key, body.as_bytes()),
            DriverStep::Delete { key } => harness.delete_object(key),
            DriverStep::Wait { seconds } => harness.wait(*seconds),
            DriverStep::CallReport => harness.call_report().and_then(|response| {
                if !(200..300).contains(&response.status_code) {
                    return Err(format!(
                        "report endpoint answered {}: {}",
                        response.status_code, response.body
                    ));
                }
                report = Some(response.body_json().unwrap_or(Value::String(response.body)));
                Ok(())
            }),
        };

        if let Err(error) = outcome {
            log_error(
                COMPONENT,
                "step_failed",
                json!({"index": index, "step": step, "error": error}),
            );
            return error_response(
                500,
                json!({
                    "error": "driver_failed",
                    "message": error,
                    "step": index,
                }),
            );
        }
        log_info(
            COMPONENT,
            "step_completed",
            json!({"index": index, "step": step}),
        );
    }

    success_response(
        200,
        &DriverResponse {
            status: "ok".to_string(),
            steps_run: script.len(),
            report,
        },
    )
}

fn script_from_event(event: &Value) -> Result<Option<Vec<DriverStep>>, String> {
    let payload = match event.get("body") {
        Some(Value::String(text)) if !text.trim().is_empty() => serde_json::from_str(text)
            .map_err(|error| format!("Malformed JSON body: {error}"))?,
        Some(Value::Object(_)) => event["body"].clone(),
        _ => event.clone(),
    };

    match payload.get("steps") {
        None | Some(Value::Null) => Ok(None),
        Some(steps) => serde_json::from_value(steps.clone())
            .map(Some)
            .map_err(|error| format!("invalid driver steps: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingHarness {
        calls: Mutex<Vec<String>>,
        report_status: u16,
        fail_put: Option<&'static str>,
    }

    impl RecordingHarness {
        fn new(report_status: u16) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                report_status,
                fail_put: None,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("poisoned mutex").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("poisoned mutex").push(call);
        }
    }

    impl DriverHarness for RecordingHarness {
        fn put_object(&self, key: &str, body: &[u8]) -> Result<(), String> {
            if self.fail_put == Some(key) {
                return Err("bucket unavailable".to_string());
            }
            self.record(format!("put {key} {}", body.len()));
            Ok(())
        }

        fn delete_object(&self, key: &str) -> Result<(), String> {
            self.record(format!("delete {key}"));
            Ok(())
        }

        fn wait(&self, seconds: u64) -> Result<(), String> {
            self.record(format!("wait {seconds}"));
            Ok(())
        }

        fn call_report(&self) -> Result<ApiGatewayResponse, String> {
            self.record("report".to_string());
            Ok(ApiGatewayResponse {
                status_code: self.report_status,
                headers: json!({}),
                body: json!({"points": 3}).to_string(),
            })
        }
    }

    #[test]
    fn default_script_runs_in_order() {
        let harness = RecordingHarness::new(200);
        let response = handle_driver_event(&json!({}), &harness);

        assert_eq!(response.status_code, 200);
        assert_eq!(
            harness.calls(),
            vec![
                "put assignment1.txt 19",
                "wait 5",
                "put assignment2.txt 28",
                "wait 10",
                "put assignment3.txt 2",
                "wait 10",
                "report",
            ]
        );
        let body = response.body_json().expect("json body");
        assert_eq!(body["report"]["points"], 3);
        assert_eq!(body["steps_run"], 7);
    }

    #[test]
    fn failing_step_stops_the_script() {
        let mut harness = RecordingHarness::new(200);
        harness.fail_put = Some("assignment2.txt");

        let response = run_driver(&default_script(), &harness);

        assert_eq!(response.status_code, 500);
        assert_eq!(harness.calls(), vec!["put assignment1.txt 19", "wait 5"]);
        assert!(response.body.contains("bucket unavailable"));
    }

    #[test]
    fn report_error_fails_the_run() {
        let harness = RecordingHarness::new(500);
        let response = run_driver(&[DriverStep::CallReport], &harness);
        assert_eq!(response.status_code, 500);
    }

    #[test]
    fn event_can_carry_a_script() {
        let harness = RecordingHarness::new(200);
        let event = json!({
            "body": "{\"steps\":[{\"action\":\"delete\",\"key\":\"assignment1.txt\"},{\"action\":\"call_report\"}]}"
        });

        let response = handle_driver_event(&event, &harness);

        assert_eq!(response.status_code, 200);
        assert_eq!(harness.calls(), vec!["delete assignment1.txt", "report"]);
    }

    #[test]
    fn malformed_script_is_rejected() {
        let harness = RecordingHarness::new(200);
        let response = handle_driver_event(&json!({"steps": [{"action": "explode"}]}), &harness);
        assert_eq!(response.status_code, 400);
        assert!(harness.calls().is_empty());
    }
}
