use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bucket_watch_core::aggregation::{latest_record, next_size_record};
use bucket_watch_core::contract::{ChangeEvent, SizeRecord};
use bucket_watch_core::notification::decode_queue_body;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::HandlerError;
use crate::adapters::aggregation_table::{AggregationTable, AppendOutcome};
use crate::telemetry::{log_error, log_info, log_warn};

const COMPONENT: &str = "size_tracking";

/// Rebuild-and-retry rounds per event while concurrent writers keep moving
/// the store's latest row.
pub const MAX_APPEND_ATTEMPTS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub messages: usize,
    pub appended: usize,
    pub duplicates: usize,
}

enum Tracked {
    Appended,
    Duplicate,
    Stale,
}

/// Appends one size record per distinct change event found in `bodies`.
///
/// Any failure aborts the batch; records appended before it stay and are
/// recognized as duplicates on redelivery. A record whose running total was
/// computed from a row another writer has since superseded is rebuilt from a
/// fresh read of the store.
pub fn handle_size_tracking_batch(
    bodies: &[String],
    table: &dyn AggregationTable,
) -> Result<TrackingSummary, HandlerError> {
    let mut summary = TrackingSummary {
        messages: bodies.len(),
        ..TrackingSummary::default()
    };
    let mut histories: HashMap<String, Vec<SizeRecord>> = HashMap::new();

    for body in bodies {
        let events = decode_queue_body(body).map_err(|error| {
            log_error(
                COMPONENT,
                "decode_failed",
                json!({"error": error.message()}),
            );
            HandlerError::from(error)
        })?;

        for event in events {
            let mut attempt = 1;
            loop {
                match track_event(&event, &mut histories, table)? {
                    Tracked::Appended => summary.appended += 1,
                    Tracked::Duplicate => summary.duplicates += 1,
                    Tracked::Stale if attempt < MAX_APPEND_ATTEMPTS => {
                        log_warn(
                            COMPONENT,
                            "append_stale",
                            json!({"store_id": event.store_id, "attempt": attempt}),
                        );
                        histories.remove(&event.store_id);
                        attempt += 1;
                        continue;
                    }
                    Tracked::Stale => {
                        log_error(
                            COMPONENT,
                            "append_contended",
                            json!({"store_id": event.store_id, "attempts": attempt}),
                        );
                        return Err(HandlerError::new(format!(
                            "store '{}' kept changing during {attempt} append attempts",
                            event.store_id
                        )));
                    }
                }
                break;
            }
        }
    }

    Ok(summary)
}

fn track_event(
    event: &ChangeEvent,
    histories: &mut HashMap<String, Vec<SizeRecord>>,
    table: &dyn AggregationTable,
) -> Result<Tracked, HandlerError> {
    let history = match histories.entry(event.store_id.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(
            table
                .query_store(&event.store_id, i64::MIN)
                .map_err(HandlerError::from)?,
        ),
    };

    let event_id = event.event_id();
    if history.iter().any(|record| record.event_id == event_id) {
        return Ok(Tracked::Duplicate);
    }

    let previous_ms = latest_record(history).map(|record| record.timestamp_ms);
    let mut record = next_size_record(history, event)?;
    // Keep rows in processing order so each total chains off the last.
    if let Some(previous_ms) = previous_ms {
        record.timestamp_ms = record.timestamp_ms.max(previous_ms + 1);
    }

    let outcome = table.append(&record, previous_ms).map_err(|error| {
        log_error(
            COMPONENT,
            "append_failed",
            json!({"store_id": record.store_id, "error": error}),
        );
        HandlerError::new(error)
    })?;

    match outcome {
        AppendOutcome::Inserted { timestamp_ms } => {
            record.timestamp_ms = timestamp_ms;
            log_info(
                COMPONENT,
                "size_record_appended",
                json!({
                    "store_id": record.store_id,
                    "object_key": record.object_key,
                    "size_delta": record.size_delta,
                    "total_size": record.total_size,
                    "timestamp_ms": timestamp_ms,
                }),
            );
            history.push(record);
            Ok(Tracked::Appended)
        }
        AppendOutcome::Duplicate => Ok(Tracked::Duplicate),
        AppendOutcome::Stale => Ok(Tracked::Stale),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::thread;

    use bucket_watch_core::aggregation::net_size;
    use bucket_watch_core::contract::SIZE_RECORD_TYPE;
    use bucket_watch_core::notification::encode_topic_message;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::adapters::aggregation_table::InMemoryAggregationTable;

    fn body(event: &ChangeEvent) -> String {
        encode_topic_message(event, "m-1").expect("encode")
    }

    struct FailingTable {
        attempts: Mutex<usize>,
    }

    impl AggregationTable for FailingTable {
        fn append(
            &self,
            _record: &SizeRecord,
            _previous_ms: Option<i64>,
        ) -> Result<AppendOutcome, String> {
            *self.attempts.lock().expect("poisoned mutex") += 1;
            Err("throughput exceeded".to_string())
        }

        fn query_store(&self, _store_id: &str, _since_ms: i64) -> Result<Vec<SizeRecord>, String> {
            Ok(Vec::new())
        }

        fn query_index(
            &self,
            _record_type: &str,
            _limit: usize,
        ) -> Result<Vec<SizeRecord>, String> {
            Ok(Vec::new())
        }

        fn peak_record(
            &self,
            _record_type: &str,
            _store_id: &str,
        ) -> Result<Option<SizeRecord>, String> {
            Ok(None)
        }
    }

    /// Fails exactly the `fail_on`-th append and delegates everything else.
    struct FlakyTable {
        inner: InMemoryAggregationTable,
        appends: AtomicUsize,
        fail_on: usize,
    }

    impl AggregationTable for FlakyTable {
        fn append(
            &self,
            record: &SizeRecord,
            previous_ms: Option<i64>,
        ) -> Result<AppendOutcome, String> {
            if self.appends.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err("connection reset".to_string());
            }
            self.inner.append(record, previous_ms)
        }

        fn query_store(&self, store_id: &str, since_ms: i64) -> Result<Vec<SizeRecord>, String> {
            self.inner.query_store(store_id, since_ms)
        }

        fn query_index(&self, record_type: &str, limit: usize) -> Result<Vec<SizeRecord>, String> {
            self.inner.query_index(record_type, limit)
        }

        fn peak_record(
            &self,
            record_type: &str,
            store_id: &str,
        ) -> Result<Option<SizeRecord>, String> {
            self.inner.peak_record(record_type, store_id)
        }
    }

    /// Holds the first two store reads until both have arrived, so two
    /// writers compute their totals from the same snapshot.
    struct InterleavingTable {
        inner: InMemoryAggregationTable,
        gate: Barrier,
        reads: AtomicUsize,
    }

    impl AggregationTable for InterleavingTable {
        fn append(
            &self,
            record: &SizeRecord,
            previous_ms: Option<i64>,
        ) -> Result<AppendOutcome, String> {
            self.inner.append(record, previous_ms)
        }

        fn query_store(&self, store_id: &str, since_ms: i64) -> Result<Vec<SizeRecord>, String> {
            let history = self.inner.query_store(store_id, since_ms)?;
            if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
                self.gate.wait();
            }
            Ok(history)
        }

        fn query_index(&self, record_type: &str, limit: usize) -> Result<Vec<SizeRecord>, String> {
            self.inner.query_index(record_type, limit)
        }

        fn peak_record(
            &self,
            record_type: &str,
            store_id: &str,
        ) -> Result<Option<SizeRecord>, String> {
            self.inner.peak_record(record_type, store_id)
        }
    }

    /// Every append loses the race to another writer.
    struct ContendedTable;

    impl AggregationTable for ContendedTable {
        fn append(
            &self,
            _record: &SizeRecord,
            _previous_ms: Option<i64>,
        ) -> Result<AppendOutcome, String> {
            Ok(AppendOutcome::Stale)
        }

        fn query_store(&self, _store_id: &str, _since_ms: i64) -> Result<Vec<SizeRecord>, String> {
            Ok(Vec::new())
        }

        fn query_index(
            &self,
            _record_type: &str,
            _limit: usize,
        ) -> Result<Vec<SizeRecord>, String> {
            Ok(Vec::new())
        }

        fn peak_record(
            &self,
            _record_type: &str,
            _store_id: &str,
        ) -> Result<Option<SizeRecord>, String> {
            Ok(None)
        }
    }

    #[test]
    fn appends_running_totals() {
        let table = InMemoryAggregationTable::new();
        let bodies = vec![
            body(&ChangeEvent::created("b", "assignment1.txt", 19, 1_000).with_sequencer("01")),
            body(&ChangeEvent::created("b", "assignment2.txt", 28, 6_000).with_sequencer("02")),
            body(&ChangeEvent::removed("b", "assignment1.txt", 7_000).with_sequencer("03")),
        ];

        let summary = handle_size_tracking_batch(&bodies, &table).expect("batch");
        assert_eq!(summary.appended, 3);

        let rows = table.query_store("b", 0).expect("query");
        assert_eq!(
            rows.iter().map(|row| row.total_size).collect::<Vec<_>>(),
            vec![19, 47, 28]
        );
        assert_eq!(rows[2].size_delta, -19);
        assert_eq!(rows[2].object_count, 1);
    }

    #[test]
    fn redelivered_events_are_not_double_counted() {
        let table = InMemoryAggregationTable::new();
        let first = body(&ChangeEvent::created("b", "a.txt", 10, 1_000).with_sequencer("01"));

        handle_size_tracking_batch(&[first.clone()], &table).expect("first batch");
        let summary =
            handle_size_tracking_batch(&[first.clone(), first], &table).expect("redelivery");

        assert_eq!(summary.appended, 0);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(table.len().expect("len"), 1);
    }

    #[test]
    fn out_of_order_event_still_chains_totals() {
        let table = InMemoryAggregationTable::new();
        let bodies = vec![
            body(&ChangeEvent::created("b", "a.txt", 10, 5_000).with_sequencer("02")),
            body(&ChangeEvent::created("b", "b.txt", 4, 5_000).with_sequencer("03")),
            body(&ChangeEvent::created("b", "c.txt", 1, 2_000).with_sequencer("01")),
        ];

        handle_size_tracking_batch(&bodies, &table).expect("batch");

        let rows = table.query_store("b", 0).expect("query");
        assert_eq!(rows.last().map(|row| row.total_size), Some(15));
        assert!(rows
            .windows(2)
            .all(|pair| pair[0].timestamp_ms < pair[1].timestamp_ms));
    }

    #[test]
    fn concurrent_batches_for_one_store_chain_totals() {
        let table = InterleavingTable {
            inner: InMemoryAggregationTable::new(),
            gate: Barrier::new(2),
            reads: AtomicUsize::new(0),
        };
        let first = body(&ChangeEvent::created("b", "assignment1.txt", 19, 1_000));
        let second = body(&ChangeEvent::created("b", "assignment2.txt", 28, 2_000));

        thread::scope(|scope| {
            let table = &table;
            scope.spawn(move || handle_size_tracking_batch(&[first], table).expect("first"));
            scope.spawn(move || handle_size_tracking_batch(&[second], table).expect("second"));
        });

        let rows = table.inner.query_store("b", i64::MIN).expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.last().map(|row| row.total_size), Some(47));
        assert_eq!(rows.last().map(|row| row.object_count), Some(2));
        let top = table.inner.query_index(SIZE_RECORD_TYPE, 1).expect("index");
        assert_eq!(top[0].total_size, 47);
    }

    #[test]
    fn endless_contention_fails_the_batch() {
        let bodies = vec![body(&ChangeEvent::created("b", "a.txt", 1, 1_000))];

        let error = handle_size_tracking_batch(&bodies, &ContendedTable).expect_err("contended");
        assert!(error.message.contains("append attempts"));
    }

    #[test]
    fn table_failure_fails_the_batch() {
        let table = FailingTable {
            attempts: Mutex::new(0),
        };
        let bodies = vec![body(&ChangeEvent::created("b", "a.txt", 1, 1_000))];

        let error = handle_size_tracking_batch(&bodies, &table).expect_err("should fail");
        assert!(error.message.contains("throughput exceeded"));
        assert_eq!(*table.attempts.lock().expect("poisoned mutex"), 1);
    }

    #[test]
    fn append_failure_mid_batch_recovers_on_redelivery() {
        let table = FlakyTable {
            inner: InMemoryAggregationTable::new(),
            appends: AtomicUsize::new(0),
            fail_on: 2,
        };
        let bodies = vec![
            body(&ChangeEvent::created("b", "one.txt", 19, 1_000).with_sequencer("01")),
            body(&ChangeEvent::created("b", "two.txt", 28, 2_000).with_sequencer("02")),
            body(&ChangeEvent::removed("b", "one.txt", 3_000).with_sequencer("03")),
        ];

        let error = handle_size_tracking_batch(&bodies, &table).expect_err("second append fails");
        assert!(error.message.contains("connection reset"));
        assert_eq!(table.inner.len().expect("len"), 1);

        let summary = handle_size_tracking_batch(&bodies, &table).expect("redelivery");
        assert_eq!(summary.appended, 2);
        assert_eq!(summary.duplicates, 1);

        let rows = table.inner.query_store("b", i64::MIN).expect("query");
        assert_eq!(rows.len(), 3);
        assert_eq!(net_size(&rows), 28);
        assert_eq!(rows.last().map(|row| row.total_size), Some(28));
    }

    #[test]
    fn generated_sequences_with_redelivery_track_bucket_size() {
        for seed in 0..8 {
            let mut rng = StdRng::seed_from_u64(seed);
            let table = InMemoryAggregationTable::new();
            let mut bucket: HashMap<String, u64> = HashMap::new();
            let mut delivered: Vec<String> = Vec::new();
            let mut injected = 0;
            let mut duplicates = 0;
            let mut step = 0_i64;

            for _ in 0..25 {
                let mut batch = Vec::new();
                if !delivered.is_empty() && rng.gen_bool(0.4) {
                    batch.push(delivered[rng.gen_range(0..delivered.len())].clone());
                    injected += 1;
                }

                let mut fresh = Vec::new();
                for _ in 0..rng.gen_range(1..4) {
                    step += 1;
                    let key = format!("k{}.txt", rng.gen_range(0..5));
                    let event = if rng.gen_bool(0.7) {
                        let size = rng.gen_range(0..100_u64);
                        bucket.insert(key.clone(), size);
                        ChangeEvent::created("b", key, size, step * 10)
                    } else {
                        bucket.remove(&key);
                        ChangeEvent::removed("b", key, step * 10)
                    };
                    let event = event.with_sequencer(format!("{step:06}"));
                    let message_id = format!("m-{step}");
                    fresh.push(encode_topic_message(&event, &message_id).expect("encode"));
                }
                batch.extend(fresh.iter().cloned());

                let summary = handle_size_tracking_batch(&batch, &table).expect("batch");
                duplicates += summary.duplicates;
                delivered.extend(fresh);
            }

            let rows = table.query_store("b", i64::MIN).expect("query");
            let expected: u64 = bucket.values().sum();
            assert_eq!(duplicates, injected, "seed {seed}");
            assert_eq!(net_size(&rows), expected as i64, "seed {seed}");
            assert_eq!(
                rows.last().map(|row| row.total_size),
                Some(expected),
                "seed {seed}"
            );
            assert_eq!(
                rows.last().map(|row| row.object_count),
                Some(bucket.len() as u64),
                "seed {seed}"
            );
        }
    }

    #[test]
    fn malformed_body_fails_the_batch() {
        let table = InMemoryAggregationTable::new();
        let result = handle_size_tracking_batch(&["not json".to_string()], &table);
        assert!(result.is_err());
        assert!(table.is_empty().expect("len"));
    }
}
