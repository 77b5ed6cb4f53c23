//! The whole topology wired in-process over the in-memory adapters.
//!
//! Time only moves through `advance_to`, which makes runs reproducible: the
//! bucket, both queues, the log group and the alarm all read the same clock.

use std::sync::{Arc, Mutex, MutexGuard};

use bucket_watch_core::aggregation::{rank_latest_totals, StoreTotal};
use bucket_watch_core::alarm::{AlarmConfig, AlarmTransition};
use bucket_watch_core::cleanup::CleanupPolicy;
use bucket_watch_core::contract::{DEFAULT_INDEX_NAME, SIZE_RECORD_TYPE};
use bucket_watch_core::fanout::Topic;
use bucket_watch_core::metric::MetricFilter;
use bucket_watch_core::queue::{DrainOutcome, QueueConfig, QueueMessage, WorkQueue};
use bucket_watch_core::storage_keys::DEFAULT_REPORT_PREFIX;
use serde_json::{json, Value};

use crate::adapters::aggregation_table::{AggregationTable, InMemoryAggregationTable};
use crate::adapters::invoke::AlarmAction;
use crate::adapters::log_store::InMemoryLogGroup;
use crate::adapters::object_store::{InMemoryObjectStore, ObjectStore};
use crate::config::{ReportingConfig, DEFAULT_REPORT_LOOKBACK_SECS};
use crate::handlers::alarm::{handle_alarm_tick, AlarmTickState};
use crate::handlers::cleaner::{handle_cleanup, CleanupResponse};
use crate::handlers::driver::DriverHarness;
use crate::handlers::logging::handle_logging_batch;
use crate::handlers::reporting::{handle_report_request, ApiGatewayResponse};
use crate::handlers::size_tracking::handle_size_tracking_batch;
use crate::handlers::HandlerError;
use crate::telemetry::log_warn;

const COMPONENT: &str = "pipeline";
/// Guards against a consumer that keeps producing work for itself.
const MAX_DRAIN_ROUNDS: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub bucket: String,
    pub start_ms: i64,
    pub queue: QueueConfig,
    pub alarm: AlarmConfig,
    pub cleanup: CleanupPolicy,
    pub report_prefix: String,
    pub report_lookback_secs: i64,
}

impl PipelineSettings {
    pub fn new(bucket: impl Into<String>, start_ms: i64) -> Self {
        Self {
            bucket: bucket.into(),
            start_ms,
            queue: QueueConfig::default(),
            alarm: AlarmConfig::default(),
            cleanup: CleanupPolicy::default(),
            report_prefix: DEFAULT_REPORT_PREFIX.to_string(),
            report_lookback_secs: DEFAULT_REPORT_LOOKBACK_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvanceReport {
    pub tracking_batches: usize,
    pub logging_batches: usize,
    pub failed_batches: usize,
    pub transitions: Vec<AlarmTransition>,
    pub cleanups: Vec<CleanupResponse>,
}

/// Consumer hooks the tests use to inject failures into a batch.
pub type BatchFault = Box<dyn Fn(&[QueueMessage]) -> Result<(), String> + Send + Sync>;

pub struct LocalPipeline {
    store: InMemoryObjectStore,
    tracking_queue: Arc<WorkQueue>,
    logging_queue: Arc<WorkQueue>,
    table: InMemoryAggregationTable,
    logs: InMemoryLogGroup,
    filter: MetricFilter,
    cleanup: CleanupPolicy,
    report: ReportingConfig,
    alarm_state: Mutex<AlarmTickState>,
    now_ms: Mutex<i64>,
    tracking_fault: Mutex<Option<BatchFault>>,
    history: Mutex<AdvanceReport>,
}

impl LocalPipeline {
    pub fn new(bucket: impl Into<String>, start_ms: i64) -> Result<Self, HandlerError> {
        Self::with_settings(PipelineSettings::new(bucket, start_ms))
    }

    pub fn with_settings(settings: PipelineSettings) -> Result<Self, HandlerError> {
        let tracking_queue = Arc::new(WorkQueue::new("size-tracking", settings.queue)?);
        let logging_queue = Arc::new(WorkQueue::new("logging", settings.queue)?);
        let start_secs = settings.start_ms.div_euclid(1_000);
        tracking_queue.set_clock(start_secs)?;
        logging_queue.set_clock(start_secs)?;

        let mut topic = Topic::new();
        topic.subscribe(tracking_queue.clone());
        topic.subscribe(logging_queue.clone());

        let store = InMemoryObjectStore::new(settings.bucket.clone(), topic);
        store.set_clock(settings.start_ms)?;

        Ok(Self {
            store,
            tracking_queue,
            logging_queue,
            table: InMemoryAggregationTable::new(),
            logs: InMemoryLogGroup::new(),
            filter: MetricFilter::default(),
            cleanup: settings.cleanup,
            report: ReportingConfig {
                bucket: settings.bucket,
                table_name: "in-memory".to_string(),
                index_name: DEFAULT_INDEX_NAME.to_string(),
                record_type: SIZE_RECORD_TYPE.to_string(),
                prefix: settings.report_prefix,
                lookback_secs: settings.report_lookback_secs,
            },
            alarm_state: Mutex::new(AlarmTickState::new(settings.alarm, settings.start_ms)?),
            now_ms: Mutex::new(settings.start_ms),
            tracking_fault: Mutex::new(None),
            history: Mutex::new(AdvanceReport::default()),
        })
    }

    pub fn store(&self) -> &InMemoryObjectStore {
        &self.store
    }

    pub fn table(&self) -> &InMemoryAggregationTable {
        &self.table
    }

    pub fn logs(&self) -> &InMemoryLogGroup {
        &self.logs
    }

    pub fn tracking_queue(&self) -> &WorkQueue {
        &self.tracking_queue
    }

    pub fn logging_queue(&self) -> &WorkQueue {
        &self.logging_queue
    }

    pub fn now_ms(&self) -> Result<i64, HandlerError> {
        Ok(*lock(&self.now_ms)?)
    }

    pub fn alarm_state(&self) -> Result<AlarmTickState, HandlerError> {
        Ok(lock(&self.alarm_state)?.clone())
    }

    /// Everything `advance_to` has done so far.
    pub fn history(&self) -> Result<AdvanceReport, HandlerError> {
        Ok(lock(&self.history)?.clone())
    }

    /// Runs before the size-tracking consumer on every batch; an error fails
    /// the batch as if the consumer had.
    pub fn set_tracking_fault(&self, fault: Option<BatchFault>) -> Result<(), HandlerError> {
        *lock(&self.tracking_fault)? = fault;
        Ok(())
    }

    pub fn put_object(&self, key: &str, body: &[u8]) -> Result<(), HandlerError> {
        self.store.put_object(key, body, None)?;
        Ok(())
    }

    pub fn delete_object(&self, key: &str) -> Result<(), HandlerError> {
        self.store.delete_object(key)?;
        Ok(())
    }

    /// Latest total of every store in the ranking index, largest first.
    pub fn store_rankings(&self) -> Result<Vec<StoreTotal>, HandlerError> {
        let records = self.table.query_index(SIZE_RECORD_TYPE, usize::MAX)?;
        Ok(rank_latest_totals(&records))
    }

    pub fn report(&self) -> Result<ApiGatewayResponse, HandlerError> {
        self.report_with(&json!({}))
    }

    pub fn report_with(&self, event: &Value) -> Result<ApiGatewayResponse, HandlerError> {
        let now_ms = self.now_ms()?;
        Ok(handle_report_request(
            event,
            &self.report,
            now_ms,
            &self.table,
            &self.store,
        ))
    }

    /// Delivers pending work at the current time, moves the clock to
    /// `target_ms`, then evaluates the alarm and runs the cleaner for every
    /// transition into `Alarm`. Changes the cleaner makes are delivered
    /// before returning.
    pub fn advance_to(&self, target_ms: i64) -> Result<AdvanceReport, HandlerError> {
        let mut report = AdvanceReport::default();
        self.drain(&mut report)?;

        let now_ms = {
            let mut now = lock(&self.now_ms)?;
            *now = (*now).max(target_ms);
            *now
        };
        let now_secs = now_ms.div_euclid(1_000);
        self.store.set_clock(now_ms)?;
        self.tracking_queue.set_clock(now_secs)?;
        self.logging_queue.set_clock(now_secs)?;
        self.drain(&mut report)?;

        let cleaner = PipelineCleaner {
            store: &self.store,
            policy: &self.cleanup,
            runs: Mutex::new(Vec::new()),
        };
        let action_error = {
            let mut state = lock(&self.alarm_state)?;
            let tick = handle_alarm_tick(&state, &self.logs, &self.filter, now_ms, &cleaner)?;
            *state = tick.state;
            report.transitions = tick.summary.transitions;
            tick.summary.action_error
        };
        report.cleanups = cleaner.runs.into_inner().map_err(|_| poisoned())?;
        if !report.cleanups.is_empty() {
            self.drain(&mut report)?;
        }

        let mut history = lock(&self.history)?;
        history.tracking_batches += report.tracking_batches;
        history.logging_batches += report.logging_batches;
        history.failed_batches += report.failed_batches;
        history.transitions.extend_from_slice(&report.transitions);
        history.cleanups.extend_from_slice(&report.cleanups);
        match action_error {
            Some(error) => Err(HandlerError::new(error)),
            None => Ok(report),
        }
    }

    pub fn advance_by(&self, millis: i64) -> Result<AdvanceReport, HandlerError> {
        let now_ms = self.now_ms()?;
        self.advance_to(now_ms.saturating_add(millis))
    }

    fn drain(&self, report: &mut AdvanceReport) -> Result<(), HandlerError> {
        let now_ms = self.now_ms()?;
        let now_secs = now_ms.div_euclid(1_000);

        let mut track = |batch: &[QueueMessage]| self.track_batch(batch);
        let mut write_logs = |batch: &[QueueMessage]| {
            handle_logging_batch(&bodies(batch), &self.logs, now_ms)
                .map(|_| ())
                .map_err(|error| error.message)
        };

        for _ in 0..MAX_DRAIN_ROUNDS {
            let tracking = self.tracking_queue.drain_batch(now_secs, &mut track)?;
            let logging = self.logging_queue.drain_batch(now_secs, &mut write_logs)?;

            let mut progressed = false;
            for (outcome, queue, counter) in [
                (tracking, self.tracking_queue.name(), &mut report.tracking_batches),
                (logging, self.logging_queue.name(), &mut report.logging_batches),
            ] {
                match outcome {
                    DrainOutcome::Empty => {}
                    DrainOutcome::Acknowledged { .. } => {
                        *counter += 1;
                        progressed = true;
                    }
                    DrainOutcome::Failed { messages, error } => {
                        report.failed_batches += 1;
                        progressed = true;
                        log_warn(
                            COMPONENT,
                            "batch_failed",
                            json!({"queue": queue, "messages": messages, "error": error}),
                        );
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }

        Err(HandlerError::new(format!(
            "queues still busy after {MAX_DRAIN_ROUNDS} drain rounds"
        )))
    }

    fn track_batch(&self, batch: &[QueueMessage]) -> Result<(), String> {
        let fault = lock(&self.tracking_fault).map_err(|error| error.message)?;
        if let Some(fault) = fault.as_ref() {
            fault(batch)?;
        }
        handle_size_tracking_batch(&bodies(batch), &self.table)
            .map(|_| ())
            .map_err(|error| error.message)
    }
}

impl DriverHarness for LocalPipeline {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), String> {
        LocalPipeline::put_object(self, key, body).map_err(|error| error.message)
    }

    fn delete_object(&self, key: &str) -> Result<(), String> {
        LocalPipeline::delete_object(self, key).map_err(|error| error.message)
    }

    fn wait(&self, seconds: u64) -> Result<(), String> {
        let millis = i64::try_from(seconds)
            .ok()
            .and_then(|secs| secs.checked_mul(1_000))
            .ok_or_else(|| format!("wait of {seconds}s is out of range"))?;
        self.advance_by(millis)
            .map(|_| ())
            .map_err(|error| error.message)
    }

    fn call_report(&self) -> Result<ApiGatewayResponse, String> {
        self.report().map_err(|error| error.message)
    }
}

struct PipelineCleaner<'a> {
    store: &'a InMemoryObjectStore,
    policy: &'a CleanupPolicy,
    runs: Mutex<Vec<CleanupResponse>>,
}

impl AlarmAction for PipelineCleaner<'_> {
    fn invoke(&self, _transition: &AlarmTransition) -> Result<(), String> {
        let response = handle_cleanup(self.store, self.policy).map_err(|error| error.message)?;
        self.runs
            .lock()
            .map_err(|_| "cleanup log lock poisoned".to_string())?
            .push(response);
        Ok(())
    }
}

fn bodies(batch: &[QueueMessage]) -> Vec<String> {
    batch.iter().map(|message| message.body.clone()).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, HandlerError> {
    mutex.lock().map_err(|_| poisoned())
}

fn poisoned() -> HandlerError {
    HandlerError::new("pipeline state lock poisoned")
}
