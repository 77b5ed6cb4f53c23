use std::sync::Mutex;

use bucket_watch_core::contract::SizeLogRecord;

use super::block_on;
use super::log_store::{latest_creation_size, line_has_event, LogLine, LogSource, LogStore};

/// Log store backed by a CloudWatch Logs group.
///
/// Records are written to stdout, which Lambda ships to the function's own
/// group. Searches go through `FilterLogEvents`, whose results lag ingestion,
/// so lines written during this invocation are also kept locally.
pub struct CloudWatchLogStore {
    log_group_name: String,
    client: aws_sdk_cloudwatchlogs::Client,
    written: Mutex<Vec<LogLine>>,
}

impl CloudWatchLogStore {
    pub fn new(log_group_name: impl Into<String>, client: aws_sdk_cloudwatchlogs::Client) -> Self {
        Self {
            log_group_name: log_group_name.into(),
            client,
            written: Mutex::new(Vec::new()),
        }
    }

    fn filter_events(
        &self,
        pattern: Option<String>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<LogLine>, String> {
        let client = self.client.clone();
        let log_group_name = self.log_group_name.clone();

        block_on(async move {
            let mut lines = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let page = client
                    .filter_log_events()
                    .log_group_name(&log_group_name)
                    .set_filter_pattern(pattern.clone())
                    .set_start_time(start_ms)
                    .set_end_time(end_ms)
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .map_err(|error| format!("failed to search log group: {error}"))?;

                for event in page.events() {
                    if let (Some(timestamp_ms), Some(message)) =
                        (event.timestamp(), event.message())
                    {
                        lines.push(LogLine {
                            timestamp_ms,
                            message: message.to_string(),
                        });
                    }
                }

                match page.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
            Ok(lines)
        })
    }

    fn written(&self) -> Result<Vec<LogLine>, String> {
        self.written
            .lock()
            .map(|lines| lines.clone())
            .map_err(|_| "log cache lock poisoned".to_string())
    }
}

impl LogStore for CloudWatchLogStore {
    fn write(&self, record: &SizeLogRecord, timestamp_ms: i64) -> Result<(), String> {
        let message = record.to_line()?;
        println!("{message}");
        self.written
            .lock()
            .map_err(|_| "log cache lock poisoned".to_string())?
            .push(LogLine {
                timestamp_ms,
                message,
            });
        Ok(())
    }

    fn find_creation_size(&self, object_name: &str) -> Result<Option<u64>, String> {
        let local = self.written()?;
        if let Some(size) = latest_creation_size(local.iter(), object_name) {
            return Ok(Some(size));
        }
        let pattern = format!("{{ $.object_name = {} }}", quote_pattern(object_name));
        let remote = self.filter_events(Some(pattern), None, None)?;
        Ok(latest_creation_size(remote.iter(), object_name))
    }

    fn contains_event(&self, event_id: &str) -> Result<bool, String> {
        if line_has_event(self.written()?.iter(), event_id) {
            return Ok(true);
        }
        let pattern = format!("{{ $.event_id = {} }}", quote_pattern(event_id));
        let remote = self.filter_events(Some(pattern), None, None)?;
        Ok(line_has_event(remote.iter(), event_id))
    }
}

impl LogSource for CloudWatchLogStore {
    fn read_lines(&self, from_ms: i64, to_ms: i64) -> Result<Vec<LogLine>, String> {
        if to_ms <= from_ms {
            return Ok(Vec::new());
        }
        // FilterLogEvents treats endTime as inclusive.
        let mut lines = self.filter_events(None, Some(from_ms), Some(to_ms - 1))?;
        lines.retain(|line| line.timestamp_ms >= from_ms && line.timestamp_ms < to_ms);
        lines.sort_by_key(|line| line.timestamp_ms);
        Ok(lines)
    }
}

fn quote_pattern(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
