use std::sync::Mutex;

use bucket_watch_core::contract::SizeLogRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp_ms: i64,
    pub message: String,
}

/// Where the logging consumer writes size log records and searches earlier ones.
pub trait LogStore {
    fn write(&self, record: &SizeLogRecord, timestamp_ms: i64) -> Result<(), String>;
    /// Size of the most recent positive record for `object_name`.
    fn find_creation_size(&self, object_name: &str) -> Result<Option<u64>, String>;
    fn contains_event(&self, event_id: &str) -> Result<bool, String>;
}

/// Read side used by the metric filter.
pub trait LogSource {
    /// Lines with `from_ms <= timestamp_ms < to_ms`, oldest first.
    fn read_lines(&self, from_ms: i64, to_ms: i64) -> Result<Vec<LogLine>, String>;
}

/// Picks the creation size for `object_name` out of raw log lines.
pub fn latest_creation_size<'a>(
    lines: impl IntoIterator<Item = &'a LogLine>,
    object_name: &str,
) -> Option<u64> {
    lines
        .into_iter()
        .filter_map(|line| {
            let record: SizeLogRecord = serde_json::from_str(line.message.trim()).ok()?;
            (record.object_name == object_name && record.size_delta > 0)
                .then_some((line.timestamp_ms, record.size_delta.unsigned_abs()))
        })
        .max_by_key(|(timestamp_ms, _)| *timestamp_ms)
        .map(|(_, size)| size)
}

pub fn line_has_event<'a>(lines: impl IntoIterator<Item = &'a LogLine>, event_id: &str) -> bool {
    lines.into_iter().any(|line| {
        serde_json::from_str::<SizeLogRecord>(line.message.trim())
            .map(|record| record.event_id.as_deref() == Some(event_id))
            .unwrap_or(false)
    })
}

/// Log group held in memory; also accepts arbitrary lines so tests can mix in
/// output the metric filter must ignore.
#[derive(Debug, Default)]
pub struct InMemoryLogGroup {
    lines: Mutex<Vec<LogLine>>,
}

impl InMemoryLogGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, timestamp_ms: i64, message: impl Into<String>) -> Result<(), String> {
        self.lock()?.push(LogLine {
            timestamp_ms,
            message: message.into(),
        });
        Ok(())
    }

    pub fn lines(&self) -> Result<Vec<LogLine>, String> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<LogLine>>, String> {
        self.lines
            .lock()
            .map_err(|_| "log group lock poisoned".to_string())
    }
}

impl LogStore for InMemoryLogGroup {
    fn write(&self, record: &SizeLogRecord, timestamp_ms: i64) -> Result<(), String> {
        let message = record.to_line()?;
        self.push_line(timestamp_ms, message)
    }

    fn find_creation_size(&self, object_name: &str) -> Result<Option<u64>, String> {
        Ok(latest_creation_size(self.lock()?.iter(), object_name))
    }

    fn contains_event(&self, event_id: &str) -> Result<bool, String> {
        Ok(line_has_event(self.lock()?.iter(), event_id))
    }
}

impl LogSource for InMemoryLogGroup {
    fn read_lines(&self, from_ms: i64, to_ms: i64) -> Result<Vec<LogLine>, String> {
        let mut lines: Vec<LogLine> = self
            .lock()?
            .iter()
            .filter(|line| line.timestamp_ms >= from_ms && line.timestamp_ms < to_ms)
            .cloned()
            .collect();
        lines.sort_by_key(|line| line.timestamp_ms);
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_line(object_name: &str, size_delta: i64, event_id: &str) -> SizeLogRecord {
        SizeLogRecord {
            object_name: object_name.to_string(),
            size_delta,
            event_id: Some(event_id.to_string()),
            store_id: Some("b".to_string()),
        }
    }

    #[test]
    fn finds_most_recent_positive_size() {
        let logs = InMemoryLogGroup::new();
        logs.write(&size_line("a.txt", 10, "e1"), 1_000)
            .expect("write");
        logs.write(&size_line("a.txt", -10, "e2"), 2_000)
            .expect("write");
        logs.write(&size_line("a.txt", 14, "e3"), 3_000)
            .expect("write");
        logs.write(&size_line("b.txt", 99, "e4"), 4_000)
            .expect("write");

        assert_eq!(logs.find_creation_size("a.txt").expect("find"), Some(14));
        assert_eq!(logs.find_creation_size("c.txt").expect("find"), None);
    }

    #[test]
    fn ignores_unstructured_lines() {
        let logs = InMemoryLogGroup::new();
        logs.push_line(1_000, "START RequestId: 1234")
            .expect("push");
        logs.write(&size_line("a.txt", 3, "e1"), 2_000)
            .expect("write");

        assert!(logs.contains_event("e1").expect("contains"));
        assert!(!logs.contains_event("e2").expect("contains"));
        assert_eq!(logs.find_creation_size("a.txt").expect("find"), Some(3));
    }

    #[test]
    fn reads_half_open_range_in_order() {
        let logs = InMemoryLogGroup::new();
        logs.push_line(3_000, "c").expect("push");
        logs.push_line(1_000, "a").expect("push");
        logs.push_line(2_000, "b").expect("push");

        let lines = logs.read_lines(1_000, 3_000).expect("read");
        assert_eq!(
            lines.iter().map(|line| line.message.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
