//! Metric filter plus alarm evaluation as one scheduled tick.
//!
//! The evaluator and a read cursor over the log group are carried between
//! ticks in `AlarmTickState`. Windows are committed one at a time: a window
//! only counts as evaluated once every alarm action it triggered has
//! succeeded. A failed action leaves its window pending, so the next tick
//! retries that window alone and never re-invokes actions of earlier ones.

use bucket_watch_core::alarm::{
    AlarmConfig, AlarmEvaluator, AlarmState, AlarmTransition, EvaluationReport,
};
use bucket_watch_core::metric::MetricFilter;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::HandlerError;
use crate::adapters::invoke::AlarmAction;
use crate::adapters::log_store::LogSource;
use crate::telemetry::{log_error, log_info, log_warn};

const COMPONENT: &str = "alarm_evaluator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTickState {
    pub evaluator: AlarmEvaluator,
    /// Log lines before this timestamp have been fed to the evaluator.
    pub log_cursor_ms: i64,
}

impl AlarmTickState {
    pub fn new(config: AlarmConfig, now_ms: i64) -> Result<Self, HandlerError> {
        let evaluator = AlarmEvaluator::new(config, now_ms)?;
        let log_cursor_ms = evaluator.next_window_secs().saturating_mul(1_000);
        Ok(Self {
            evaluator,
            log_cursor_ms,
        })
    }

    /// Restores persisted state, starting over when there is none, when it
    /// cannot be parsed, or when it was built for a different alarm config.
    pub fn restore(
        persisted: Option<&[u8]>,
        config: AlarmConfig,
        now_ms: i64,
    ) -> Result<Self, HandlerError> {
        let Some(bytes) = persisted else {
            return Self::new(config, now_ms);
        };
        match serde_json::from_slice::<AlarmTickState>(bytes) {
            Ok(state) if *state.evaluator.config() == config => Ok(state),
            Ok(_) => {
                log_warn(
                    COMPONENT,
                    "alarm_config_changed",
                    json!({"alarm": config.name}),
                );
                Self::new(config, now_ms)
            }
            Err(error) => {
                log_warn(
                    COMPONENT,
                    "alarm_state_unreadable",
                    json!({"error": error.to_string()}),
                );
                Self::new(config, now_ms)
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HandlerError> {
        serde_json::to_vec(self)
            .map_err(|error| HandlerError::new(format!("failed to serialize alarm state: {error}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTickSummary {
    pub lines_read: usize,
    pub samples: usize,
    pub late_samples: usize,
    pub evaluated_windows: usize,
    pub transitions: Vec<AlarmTransition>,
    pub actions_invoked: usize,
    pub state: AlarmState,
    /// Set when an alarm action failed; the returned state stops before the
    /// window that triggered it.
    pub action_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmTick {
    pub state: AlarmTickState,
    pub summary: AlarmTickSummary,
}

/// Feeds log lines written since the last tick through `filter`, evaluates
/// every window completed by `now_ms`, and invokes `action` once per
/// transition into `Alarm`.
///
/// Only reading the log group is an error. A failed action is reported in
/// `summary.action_error` next to the state committed up to that window, and
/// the caller persists that state before surfacing the failure.
pub fn handle_alarm_tick(
    state: &AlarmTickState,
    logs: &dyn LogSource,
    filter: &MetricFilter,
    now_ms: i64,
    action: &dyn AlarmAction,
) -> Result<AlarmTick, HandlerError> {
    let mut next = state.clone();
    let mut summary = AlarmTickSummary {
        lines_read: 0,
        samples: 0,
        late_samples: 0,
        evaluated_windows: 0,
        transitions: Vec::new(),
        actions_invoked: 0,
        state: next.evaluator.state(),
        action_error: None,
    };

    if now_ms > next.log_cursor_ms {
        let lines = logs.read_lines(next.log_cursor_ms, now_ms)?;
        summary.lines_read = lines.len();
        for line in &lines {
            let Some(sample) = filter.extract(&line.message, line.timestamp_ms) else {
                continue;
            };
            if next.evaluator.ingest(sample) {
                summary.samples += 1;
            } else {
                summary.late_samples += 1;
            }
        }
        next.log_cursor_ms = now_ms;
    }

    if summary.late_samples > 0 {
        log_warn(
            COMPONENT,
            "late_samples_dropped",
            json!({"count": summary.late_samples}),
        );
    }

    let period_secs = next.evaluator.config().period_secs;
    loop {
        let window_end_ms = next
            .evaluator
            .next_window_secs()
            .saturating_add(period_secs)
            .saturating_mul(1_000);
        if window_end_ms > now_ms {
            break;
        }

        let committed = next.evaluator.clone();
        let report = next.evaluator.evaluate_until(window_end_ms);
        if let Err(error) = run_actions(&report, action) {
            next.evaluator = committed;
            summary.action_error = Some(error);
            break;
        }

        for transition in &report.transitions {
            log_info(
                COMPONENT,
                "alarm_transition",
                json!({
                    "alarm": transition.alarm_name,
                    "from": transition.from,
                    "to": transition.to,
                    "window_start_secs": transition.window_start_secs,
                    "value": transition.value,
                    "reason": transition.reason,
                }),
            );
        }
        summary.actions_invoked += report.alarm_entries().count();
        summary.evaluated_windows += report.evaluated_windows;
        summary.transitions.extend(report.transitions);
    }

    summary.state = next.evaluator.state();
    Ok(AlarmTick {
        state: next,
        summary,
    })
}

fn run_actions(report: &EvaluationReport, action: &dyn AlarmAction) -> Result<(), String> {
    for transition in report.alarm_entries() {
        action.invoke(transition).map_err(|error| {
            log_error(
                COMPONENT,
                "alarm_action_failed",
                json!({
                    "alarm": transition.alarm_name,
                    "window_start_secs": transition.window_start_secs,
                    "error": error,
                }),
            );
            error
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bucket_watch_core::alarm::MissingDataPolicy;
    use bucket_watch_core::contract::SizeLogRecord;

    use super::*;
    use crate::adapters::log_store::{InMemoryLogGroup, LogStore};

    struct RecordingAction {
        calls: Mutex<Vec<AlarmTransition>>,
        /// Calls from this one onwards fail.
        fail_from: Option<usize>,
    }

    impl RecordingAction {
        fn new(fail_from: Option<usize>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_from,
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().expect("poisoned mutex").len()
        }
    }

    impl AlarmAction for RecordingAction {
        fn invoke(&self, transition: &AlarmTransition) -> Result<(), String> {
            let mut calls = self.calls.lock().expect("poisoned mutex");
            calls.push(transition.clone());
            match self.fail_from {
                Some(first_failure) if calls.len() >= first_failure => {
                    Err("cleaner unavailable".to_string())
                }
                _ => Ok(()),
            }
        }
    }

    fn write(logs: &InMemoryLogGroup, name: &str, size_delta: i64, timestamp_ms: i64) {
        logs.write(
            &SizeLogRecord {
                object_name: name.to_string(),
                size_delta,
                event_id: Some(format!("{name}-{timestamp_ms}")),
                store_id: Some("b".to_string()),
            },
            timestamp_ms,
        )
        .expect("write");
    }

    fn tick(
        state: &AlarmTickState,
        logs: &InMemoryLogGroup,
        now_ms: i64,
        action: &RecordingAction,
    ) -> AlarmTick {
        handle_alarm_tick(state, logs, &MetricFilter::default(), now_ms, action).expect("tick")
    }

    fn fresh_state() -> AlarmTickState {
        AlarmTickState::new(AlarmConfig::default(), 0).expect("state")
    }

    #[test]
    fn breach_invokes_action_once() {
        let logs = InMemoryLogGroup::new();
        write(&logs, "assignment1.txt", 19, 1_000);
        write(&logs, "assignment2.txt", 28, 6_000);
        let action = RecordingAction::new(None);

        let first = tick(&fresh_state(), &logs, 30_000, &action);
        assert_eq!(first.summary.samples, 2);
        assert_eq!(first.summary.evaluated_windows, 0);

        let second = tick(&first.state, &logs, 61_000, &action);
        assert_eq!(second.summary.state, AlarmState::Alarm);
        assert_eq!(action.calls(), 1);

        let third = tick(&second.state, &logs, 61_500, &action);
        assert!(third.summary.transitions.is_empty());
        assert_eq!(action.calls(), 1);
    }

    #[test]
    fn no_log_entries_stay_non_breaching() {
        let logs = InMemoryLogGroup::new();
        let action = RecordingAction::new(None);

        let quiet = tick(&fresh_state(), &logs, 300_000, &action);

        assert_eq!(quiet.summary.evaluated_windows, 5);
        assert_eq!(quiet.summary.state, AlarmState::Ok);
        assert_eq!(action.calls(), 0);
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let logs = InMemoryLogGroup::new();
        logs.push_line(1_000, "START RequestId: abc").expect("push");
        logs.push_line(2_000, r#"{"object_name":"a.txt"}"#)
            .expect("push");
        let action = RecordingAction::new(None);

        let result = tick(&fresh_state(), &logs, 60_000, &action);

        assert_eq!(result.summary.lines_read, 2);
        assert_eq!(result.summary.samples, 0);
    }

    #[test]
    fn failed_action_keeps_window_pending() {
        let logs = InMemoryLogGroup::new();
        write(&logs, "assignment2.txt", 28, 1_000);
        let failing = RecordingAction::new(Some(1));

        let failed = tick(&fresh_state(), &logs, 60_000, &failing);
        let error = failed.summary.action_error.expect("action failure");
        assert!(error.contains("cleaner unavailable"));
        assert_eq!(failed.summary.evaluated_windows, 0);
        assert_eq!(failed.state.evaluator.next_window_secs(), 0);
        assert_eq!(failed.state.evaluator.state(), AlarmState::InsufficientData);

        let working = RecordingAction::new(None);
        let retried = tick(&failed.state, &logs, 60_000, &working);
        assert_eq!(retried.summary.state, AlarmState::Alarm);
        assert!(retried.summary.action_error.is_none());
        assert_eq!(working.calls(), 1);
    }

    #[test]
    fn failed_second_action_does_not_repeat_the_first() {
        let logs = InMemoryLogGroup::new();
        write(&logs, "assignment1.txt", 28, 1_000);
        write(&logs, "assignment2.txt", 28, 125_000);
        let flaky = RecordingAction::new(Some(2));

        let failed = tick(&fresh_state(), &logs, 180_000, &flaky);
        assert_eq!(flaky.calls(), 2);
        assert!(failed.summary.action_error.is_some());
        assert_eq!(failed.summary.evaluated_windows, 2);
        assert_eq!(failed.summary.actions_invoked, 1);
        assert_eq!(failed.state.evaluator.next_window_secs(), 120);
        assert_eq!(failed.summary.state, AlarmState::Ok);

        let working = RecordingAction::new(None);
        let retried = tick(&failed.state, &logs, 180_000, &working);
        assert_eq!(working.calls(), 1);
        assert_eq!(retried.summary.evaluated_windows, 1);
        assert_eq!(retried.summary.state, AlarmState::Alarm);
    }

    #[test]
    fn state_round_trips_and_resets_on_config_change() {
        let state = AlarmTickState::new(AlarmConfig::default(), 125_000).expect("state");
        let bytes = state.to_bytes().expect("serialize");

        let config = AlarmConfig::default();
        let restored =
            AlarmTickState::restore(Some(bytes.as_slice()), config, 500_000).expect("restore");
        assert_eq!(restored, state);

        let changed = AlarmConfig {
            missing_data: MissingDataPolicy::Ignore,
            ..AlarmConfig::default()
        };
        let reset =
            AlarmTickState::restore(Some(bytes.as_slice()), changed, 500_000).expect("restore");
        assert_eq!(reset.evaluator.next_window_secs(), 480);
        assert_eq!(reset.log_cursor_ms, 480_000);
    }

    #[test]
    fn garbage_state_starts_over() {
        let garbage = b"not json".as_slice();
        let config = AlarmConfig::default();
        let restored = AlarmTickState::restore(Some(garbage), config, 61_000).expect("restore");
        assert_eq!(restored.evaluator.state(), AlarmState::InsufficientData);
        assert_eq!(restored.log_cursor_ms, 60_000);
    }
}
