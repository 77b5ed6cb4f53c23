//! Threshold alarm evaluated over fixed metric windows.
//!
//! Each completed window is evaluated exactly once and in order. The alarm
//! enters `Alarm` after `evaluation_periods` consecutive breaching windows and
//! leaves it on the first non-breaching one. A window with no samples is
//! resolved through the configured missing-data policy; it is never treated
//! as a zero-valued sample.

use serde::{Deserialize, Serialize};

use crate::contract::ValidationError;
use crate::metric::{MetricSample, WindowAccumulator, DEFAULT_PERIOD_SECS};

pub const DEFAULT_THRESHOLD: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThanThreshold,
    GreaterThanOrEqualToThreshold,
    LessThanThreshold,
    LessThanOrEqualToThreshold,
}

impl ComparisonOperator {
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThanThreshold => value > threshold,
            Self::GreaterThanOrEqualToThreshold => value >= threshold,
            Self::LessThanThreshold => value < threshold,
            Self::LessThanOrEqualToThreshold => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    NotBreaching,
    Breaching,
    /// Keep the current state and consecutive-breach count.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    InsufficientData,
    Ok,
    Alarm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub name: String,
    pub threshold: f64,
    pub comparison: ComparisonOperator,
    pub period_secs: i64,
    pub evaluation_periods: u32,
    pub missing_data: MissingDataPolicy,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            name: "total-size-alarm".to_string(),
            threshold: DEFAULT_THRESHOLD,
            comparison: ComparisonOperator::GreaterThanThreshold,
            period_secs: DEFAULT_PERIOD_SECS,
            evaluation_periods: 1,
            missing_data: MissingDataPolicy::NotBreaching,
        }
    }
}

impl AlarmConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.period_secs <= 0 {
            return Err(ValidationError::new("period_secs must be positive"));
        }
        if self.evaluation_periods == 0 {
            return Err(ValidationError::new("evaluation_periods must be at least 1"));
        }
        if !self.threshold.is_finite() {
            return Err(ValidationError::new("threshold must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTransition {
    pub alarm_name: String,
    pub from: AlarmState,
    pub to: AlarmState,
    pub window_start_secs: i64,
    pub value: Option<f64>,
    pub reason: String,
}

impl AlarmTransition {
    pub fn entered_alarm(&self) -> bool {
        self.to == AlarmState::Alarm
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub evaluated_windows: usize,
    pub transitions: Vec<AlarmTransition>,
}

impl EvaluationReport {
    pub fn alarm_entries(&self) -> impl Iterator<Item = &AlarmTransition> {
        self.transitions
            .iter()
            .filter(|transition| transition.entered_alarm())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvaluator {
    config: AlarmConfig,
    windows: WindowAccumulator,
    state: AlarmState,
    consecutive_breaching: u32,
    next_window_secs: i64,
    late_samples: u64,
}

impl AlarmEvaluator {
    /// Starts evaluating at the window containing `start_ms`.
    pub fn new(config: AlarmConfig, start_ms: i64) -> Result<Self, ValidationError> {
        config.validate()?;
        let windows = WindowAccumulator::new(config.period_secs)?;
        let next_window_secs = windows.window_start(start_ms);
        Ok(Self {
            config,
            windows,
            state: AlarmState::InsufficientData,
            consecutive_breaching: 0,
            next_window_secs,
            late_samples: 0,
        })
    }

    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn late_samples(&self) -> u64 {
        self.late_samples
    }

    /// First window not yet evaluated, as epoch seconds.
    pub fn next_window_secs(&self) -> i64 {
        self.next_window_secs
    }

    /// Returns false when the sample's window was already evaluated.
    pub fn ingest(&mut self, sample: MetricSample) -> bool {
        if self.windows.window_start(sample.timestamp_ms) < self.next_window_secs {
            self.late_samples += 1;
            return false;
        }
        self.windows.add(sample);
        true
    }

    /// Evaluates every window that has fully elapsed by `now_ms`.
    pub fn evaluate_until(&mut self, now_ms: i64) -> EvaluationReport {
        let now_secs = now_ms.div_euclid(1_000);
        let period = self.config.period_secs;
        let mut report = EvaluationReport::default();

        while self.next_window_secs + period <= now_secs {
            let window_start = self.next_window_secs;
            if let Some(transition) = self.evaluate_window(window_start) {
                report.transitions.push(transition);
            }
            report.evaluated_windows += 1;
            self.next_window_secs += period;
        }

        report
    }

    fn evaluate_window(&mut self, window_start: i64) -> Option<AlarmTransition> {
        let value = self.windows.take(window_start);
        let breaching = match value {
            Some(sum) => Some(self.config.comparison.breaches(sum, self.config.threshold)),
            None => match self.config.missing_data {
                MissingDataPolicy::NotBreaching => Some(false),
                MissingDataPolicy::Breaching => Some(true),
                MissingDataPolicy::Ignore => None,
            },
        }?;

        let target = if breaching {
            self.consecutive_breaching = self.consecutive_breaching.saturating_add(1);
            if self.consecutive_breaching >= self.config.evaluation_periods {
                AlarmState::Alarm
            } else {
                return None;
            }
        } else {
            self.consecutive_breaching = 0;
            AlarmState::Ok
        };

        if target == self.state {
            return None;
        }

        let from = self.state;
        self.state = target;
        Some(AlarmTransition {
            alarm_name: self.config.name.clone(),
            from,
            to: target,
            window_start_secs: window_start,
            value,
            reason: self.describe(value, breaching),
        })
    }

    fn describe(&self, value: Option<f64>, breaching: bool) -> String {
        let verdict = if breaching {
            "breaching"
        } else {
            "not breaching"
        };
        match value {
            Some(sum) => format!(
                "window sum {sum} {verdict} threshold {} over {} period(s)",
                self.config.threshold, self.config.evaluation_periods
            ),
            None => format!("no datapoints; treated as {verdict}"),
        }
    }
}
