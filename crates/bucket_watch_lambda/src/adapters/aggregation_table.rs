use std::collections::BTreeMap;
use std::sync::Mutex;

use bucket_watch_core::contract::SizeRecord;

/// Upper bound on forward timestamp shifts when two distinct events of one
/// store land on the same millisecond.
pub const MAX_TIMESTAMP_SHIFTS: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { timestamp_ms: i64 },
    Duplicate,
    /// Another writer appended to the store after the row the record's
    /// running total was computed from. Nothing was written.
    Stale,
}

/// Append-only size history keyed by `(store_id, timestamp_ms)` with a
/// secondary view ordered by `(record_type, total_size)`.
pub trait AggregationTable {
    /// Never overwrites an existing row. `previous_ms` is the timestamp of the
    /// store's latest row when `record` was built (`None` for an empty store);
    /// the append only happens while that is still the latest row.
    fn append(
        &self,
        record: &SizeRecord,
        previous_ms: Option<i64>,
    ) -> Result<AppendOutcome, String>;
    /// Rows of `store_id` at or after `since_ms`, oldest first.
    fn query_store(&self, store_id: &str, since_ms: i64) -> Result<Vec<SizeRecord>, String>;
    /// Rows of `record_type`, largest `total_size` first.
    fn query_index(&self, record_type: &str, limit: usize) -> Result<Vec<SizeRecord>, String>;
    /// The largest-total row of `store_id` in the `record_type` index.
    fn peak_record(&self, record_type: &str, store_id: &str) -> Result<Option<SizeRecord>, String>;
}

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<(String, i64), SizeRecord>,
    // (record_type, total_size, store_id, timestamp_ms)
    index: BTreeMap<(String, u64, String, i64), ()>,
}

#[derive(Debug, Default)]
pub struct InMemoryAggregationTable {
    state: Mutex<TableState>,
}

impl InMemoryAggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, String> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TableState>, String> {
        self.state
            .lock()
            .map_err(|_| "aggregation table lock poisoned".to_string())
    }
}

impl AggregationTable for InMemoryAggregationTable {
    fn append(
        &self,
        record: &SizeRecord,
        previous_ms: Option<i64>,
    ) -> Result<AppendOutcome, String> {
        let mut state = self.lock()?;
        let latest_ms = state
            .rows
            .range((record.store_id.clone(), i64::MIN)..=(record.store_id.clone(), i64::MAX))
            .next_back()
            .map(|((_, timestamp_ms), _)| *timestamp_ms);
        if latest_ms != previous_ms {
            return Ok(AppendOutcome::Stale);
        }

        let mut timestamp_ms = record.timestamp_ms;

        for _ in 0..=MAX_TIMESTAMP_SHIFTS {
            let key = (record.store_id.clone(), timestamp_ms);
            let same_event = state
                .rows
                .get(&key)
                .map(|existing| existing.event_id == record.event_id);
            match same_event {
                Some(true) => return Ok(AppendOutcome::Duplicate),
                Some(false) => timestamp_ms += 1,
                None => {
                    let mut stored = record.clone();
                    stored.timestamp_ms = timestamp_ms;
                    // Both views change under the same lock.
                    state.index.insert(
                        (
                            stored.record_type.clone(),
                            stored.total_size,
                            stored.store_id.clone(),
                            timestamp_ms,
                        ),
                        (),
                    );
                    state.rows.insert(key, stored);
                    return Ok(AppendOutcome::Inserted { timestamp_ms });
                }
            }
        }

        Err(format!(
            "no free timestamp for '{}' within {MAX_TIMESTAMP_SHIFTS} ms of {}",
            record.store_id, record.timestamp_ms
        ))
    }

    fn query_store(&self, store_id: &str, since_ms: i64) -> Result<Vec<SizeRecord>, String> {
        let state = self.lock()?;
        Ok(state
            .rows
            .range((store_id.to_string(), since_ms)..=(store_id.to_string(), i64::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn query_index(&self, record_type: &str, limit: usize) -> Result<Vec<SizeRecord>, String> {
        let state = self.lock()?;
        Ok(state
            .index
            .keys()
            .rev()
            .filter(|(kind, _, _, _)| kind == record_type)
            .take(limit)
            .filter_map(|(_, _, store_id, timestamp_ms)| {
                state.rows.get(&(store_id.clone(), *timestamp_ms)).cloned()
            })
            .collect())
    }

    fn peak_record(&self, record_type: &str, store_id: &str) -> Result<Option<SizeRecord>, String> {
        let state = self.lock()?;
        Ok(state
            .index
            .keys()
            .rev()
            .find(|(kind, _, store, _)| kind == record_type && store == store_id)
            .and_then(|(_, _, store, timestamp_ms)| {
                state.rows.get(&(store.clone(), *timestamp_ms)).cloned()
            }))
    }
}
