//! Structured JSON log lines on stderr.
//!
//! Stdout is reserved for size log records, which the metric filter reads
//! from the function's log group.

use serde_json::{json, Value};

pub fn log_info(component: &str, event: &str, details: Value) {
    emit(component, None, event, details);
}

pub fn log_warn(component: &str, event: &str, details: Value) {
    emit(component, Some("warn"), event, details);
}

pub fn log_error(component: &str, event: &str, details: Value) {
    emit(component, Some("error"), event, details);
}

fn emit(component: &str, level: Option<&str>, event: &str, details: Value) {
    eprintln!("{}", format_line(component, level, event, details));
}

fn format_line(component: &str, level: Option<&str>, event: &str, details: Value) -> Value {
    let mut line = json!({
        "component": component,
        "event": event,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": details,
    });
    if let (Some(level), Some(object)) = (level, line.as_object_mut()) {
        object.insert("level".to_string(), Value::from(level));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_lines_omit_level() {
        let line = format_line("cleaner", None, "cleanup_started", json!({"bucket": "b"}));
        assert_eq!(line["component"], "cleaner");
        assert_eq!(line["details"]["bucket"], "b");
        assert!(line.get("level").is_none());
    }

    #[test]
    fn error_lines_carry_level() {
        let line = format_line("reporting", Some("error"), "render_failed", json!({}));
        assert_eq!(line["level"], "error");
        assert!(line["timestamp"].as_str().is_some());
    }
}
