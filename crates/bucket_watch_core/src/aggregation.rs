//! Size history math over append-only `SizeRecord` rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contract::{ChangeEvent, ChangeKind, SizeRecord, ValidationError, SIZE_RECORD_TYPE};

/// Bytes currently attributed to `object_key` by earlier records of a store.
pub fn attributed_size(history: &[SizeRecord], object_key: &str) -> i64 {
    history
        .iter()
        .filter(|record| record.object_key == object_key)
        .map(|record| record.size_delta)
        .sum()
}

/// Whether the latest record touching `object_key` left it in the store.
/// Zero-byte objects count as present.
pub fn is_present(history: &[SizeRecord], object_key: &str) -> bool {
    history
        .iter()
        .filter(|record| record.object_key == object_key)
        .max_by(|left, right| record_order(left, right))
        .is_some_and(|record| record.event_type == ChangeKind::Created)
}

pub fn latest_record(history: &[SizeRecord]) -> Option<&SizeRecord> {
    history
        .iter()
        .max_by(|left, right| record_order(left, right))
}

fn record_order(left: &SizeRecord, right: &SizeRecord) -> std::cmp::Ordering {
    left.timestamp_ms
        .cmp(&right.timestamp_ms)
        .then_with(|| left.event_id.cmp(&right.event_id))
}

/// Builds the record that appending `event` to `history` should produce.
///
/// `history` holds the store's earlier records in any order. A create of an
/// existing key counts as an overwrite, so the delta is the size difference.
pub fn next_size_record(
    history: &[SizeRecord],
    event: &ChangeEvent,
) -> Result<SizeRecord, ValidationError> {
    if let Some(foreign) = history
        .iter()
        .find(|record| record.store_id != event.store_id)
    {
        return Err(ValidationError::new(format!(
            "history for '{}' contains a record of '{}'",
            event.store_id, foreign.store_id
        )));
    }

    let attributed = attributed_size(history, &event.object_key);
    let was_present = is_present(history, &event.object_key);

    let (size_delta, is_present) = match event.event_type {
        ChangeKind::Created => {
            let size = event.size.ok_or_else(|| {
                ValidationError::new(format!(
                    "created event for '{}' has no size",
                    event.object_key
                ))
            })?;
            let size = i64::try_from(size)
                .map_err(|_| ValidationError::new("object size exceeds i64 range"))?;
            (size - attributed, true)
        }
        ChangeKind::Removed => (-attributed, false),
    };

    let (previous_total, previous_count) = latest_record(history)
        .map(|record| (record.total_size, record.object_count))
        .unwrap_or((0, 0));

    let total_size = apply_delta(previous_total, size_delta);
    let object_count = match (was_present, is_present) {
        (false, true) => previous_count + 1,
        (true, false) => previous_count.saturating_sub(1),
        _ => previous_count,
    };

    Ok(SizeRecord {
        store_id: event.store_id.clone(),
        timestamp_ms: event.timestamp_ms,
        event_id: event.event_id(),
        object_key: event.object_key.clone(),
        event_type: event.event_type,
        size_delta,
        total_size,
        object_count,
        record_type: SIZE_RECORD_TYPE.to_string(),
    })
}

fn apply_delta(total: u64, delta: i64) -> u64 {
    if delta >= 0 {
        total.saturating_add(delta.unsigned_abs())
    } else {
        total.saturating_sub(delta.unsigned_abs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTotal {
    pub store_id: String,
    pub total_size: u64,
    pub object_count: u64,
    pub timestamp_ms: i64,
}

/// Latest total per store, largest first (ties by store id).
pub fn rank_latest_totals(records: &[SizeRecord]) -> Vec<StoreTotal> {
    let mut latest: BTreeMap<&str, &SizeRecord> = BTreeMap::new();
    for record in records {
        let newer = match latest.get(record.store_id.as_str()) {
            Some(current) => record_order(record, current).is_gt(),
            None => true,
        };
        if newer {
            latest.insert(record.store_id.as_str(), record);
        }
    }

    let mut ranked: Vec<StoreTotal> = latest
        .into_values()
        .map(|record| StoreTotal {
            store_id: record.store_id.clone(),
            total_size: record.total_size,
            object_count: record.object_count,
            timestamp_ms: record.timestamp_ms,
        })
        .collect();
    ranked.sort_by(|left, right| {
        right
            .total_size
            .cmp(&left.total_size)
            .then_with(|| left.store_id.cmp(&right.store_id))
    });
    ranked
}

/// Net size change implied by a history: the sum of all deltas.
pub fn net_size(history: &[SizeRecord]) -> i64 {
    history.iter().map(|record| record.size_delta).sum()
}
