use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::ValidationError;

pub const SIZE_DELTA_FIELD: &str = "size_delta";
pub const DEFAULT_PERIOD_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Matches JSON log lines that carry a numeric field and extracts its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricFilter {
    field: String,
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self::field_exists(SIZE_DELTA_FIELD)
    }
}

impl MetricFilter {
    pub fn field_exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Lines that are not JSON objects, or lack a numeric field, do not match.
    pub fn extract(&self, line: &str, timestamp_ms: i64) -> Option<MetricSample> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let number = value.as_object()?.get(&self.field)?.as_f64()?;
        Some(MetricSample {
            timestamp_ms,
            value: number,
        })
    }
}

/// Sums samples into fixed windows aligned to the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    period_secs: i64,
    sums: BTreeMap<i64, f64>,
}

impl WindowAccumulator {
    pub fn new(period_secs: i64) -> Result<Self, ValidationError> {
        if period_secs <= 0 {
            return Err(ValidationError::new("period_secs must be positive"));
        }
        Ok(Self {
            period_secs,
            sums: BTreeMap::new(),
        })
    }

    pub fn period_secs(&self) -> i64 {
        self.period_secs
    }

    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        let secs = timestamp_ms.div_euclid(1_000);
        secs - secs.rem_euclid(self.period_secs)
    }

    pub fn add(&mut self, sample: MetricSample) {
        let start = self.window_start(sample.timestamp_ms);
        *self.sums.entry(start).or_insert(0.0) += sample.value;
    }

    /// Removes and returns the sum of the window starting at `window_start`;
    /// `None` means no sample landed in it.
    pub fn take(&mut self, window_start: i64) -> Option<f64> {
        self.sums.remove(&window_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_size_delta_from_json_line() {
        let filter = MetricFilter::default();
        let sample = filter
            .extract(r#"{"object_name":"a.txt","size_delta":-28}"#, 5_000)
            .expect("line should match");
        assert_eq!(sample.value, -28.0);
        assert_eq!(sample.timestamp_ms, 5_000);
    }

    #[test]
    fn ignores_lines_without_numeric_field() {
        let filter = MetricFilter::default();
        assert!(filter.extract("START RequestId: 123", 0).is_none());
        assert!(filter.extract(r#"{"object_name":"a.txt"}"#, 0).is_none());
        assert!(filter.extract(r#"{"size_delta":"12"}"#, 0).is_none());
        assert!(filter.extract(r#"[1,2]"#, 0).is_none());
    }

    #[test]
    fn sums_samples_per_window() {
        let mut windows = WindowAccumulator::new(60).expect("period");
        windows.add(MetricSample {
            timestamp_ms: 60_000,
            value: 19.0,
        });
        windows.add(MetricSample {
            timestamp_ms: 119_999,
            value: 28.0,
        });
        windows.add(MetricSample {
            timestamp_ms: 120_000,
            value: 2.0,
        });

        assert_eq!(windows.take(60), Some(47.0));
        assert_eq!(windows.take(120), Some(2.0));
        assert_eq!(windows.take(180), None);
    }

    #[test]
    fn negative_timestamps_align_down() {
        let windows = WindowAccumulator::new(60).expect("period");
        assert_eq!(windows.window_start(-1), -60);
    }
}
