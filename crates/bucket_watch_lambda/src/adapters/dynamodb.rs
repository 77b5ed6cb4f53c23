use std::collections::HashMap;

use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem};
use bucket_watch_core::contract::{ChangeKind, SizeRecord};

use super::aggregation_table::{AggregationTable, AppendOutcome, MAX_TIMESTAMP_SHIFTS};
use super::block_on;

const STORE_ATTR: &str = "bucket_name";
const TIMESTAMP_ATTR: &str = "timestamp";
const EVENT_ID_ATTR: &str = "event_id";
const OBJECT_KEY_ATTR: &str = "object_key";
const EVENT_TYPE_ATTR: &str = "event_type";
const SIZE_DELTA_ATTR: &str = "size_delta";
const TOTAL_SIZE_ATTR: &str = "total_size";
const OBJECT_COUNT_ATTR: &str = "object_count";
const RECORD_TYPE_ATTR: &str = "record_type";
const LATEST_ATTR: &str = "latest_timestamp";
/// Sort key of the per-store head item that tracks the latest row. It has no
/// `record_type`, so it never appears in the index.
const HEAD_TIMESTAMP: i64 = -1;
const CHECK_FAILED: &str = "ConditionalCheckFailed";
/// Page size used while searching the index for one store's peak.
const PEAK_PAGE_SIZE: i32 = 100;

type Item = HashMap<String, AttributeValue>;

enum AppendAttempt {
    Written,
    HeadMoved,
    RowOccupied,
}

/// Aggregation table on DynamoDB: partition key `bucket_name`, sort key
/// `timestamp` (epoch ms), and a global secondary index on
/// `(record_type, total_size)` that DynamoDB maintains with each write.
///
/// Each append is a transaction that also moves the store's head item, so
/// two writers that computed a total from the same latest row cannot both
/// succeed.
pub struct DynamoAggregationTable {
    table_name: String,
    index_name: String,
    client: aws_sdk_dynamodb::Client,
}

impl DynamoAggregationTable {
    pub fn new(
        table_name: impl Into<String>,
        index_name: impl Into<String>,
        client: aws_sdk_dynamodb::Client,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            index_name: index_name.into(),
            client,
        }
    }

    fn try_append(
        &self,
        record: &SizeRecord,
        timestamp_ms: i64,
        previous_ms: Option<i64>,
    ) -> Result<AppendAttempt, String> {
        let head = Put::builder()
            .table_name(&self.table_name)
            .item(STORE_ATTR, AttributeValue::S(record.store_id.clone()))
            .item(
                TIMESTAMP_ATTR,
                AttributeValue::N(HEAD_TIMESTAMP.to_string()),
            )
            .item(LATEST_ATTR, AttributeValue::N(timestamp_ms.to_string()));
        let head = match previous_ms {
            None => head
                .condition_expression("attribute_not_exists(#ts)")
                .expression_attribute_names("#ts", TIMESTAMP_ATTR),
            // Stores written before the head item existed start without one.
            Some(previous_ms) => head
                .condition_expression("attribute_not_exists(#ts) OR #latest = :previous")
                .expression_attribute_names("#ts", TIMESTAMP_ATTR)
                .expression_attribute_names("#latest", LATEST_ATTR)
                .expression_attribute_values(
                    ":previous",
                    AttributeValue::N(previous_ms.to_string()),
                ),
        }
        .build()
        .map_err(|error| format!("invalid head item write: {error}"))?;

        let row = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item_from_record(record, timestamp_ms)))
            .condition_expression("attribute_not_exists(#ts)")
            .expression_attribute_names("#ts", TIMESTAMP_ATTR)
            .build()
            .map_err(|error| format!("invalid size record write: {error}"))?;

        let request = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(head).build())
            .transact_items(TransactWriteItem::builder().put(row).build());

        block_on(async move {
            let error = match request.send().await {
                Ok(_) => return Ok(AppendAttempt::Written),
                Err(error) => error,
            };
            let Some(TransactWriteItemsError::TransactionCanceledException(cancelled)) =
                error.as_service_error()
            else {
                return Err(format!("failed to write size record: {error}"));
            };
            let codes: Vec<Option<&str>> = cancelled
                .cancellation_reasons()
                .iter()
                .map(|reason| reason.code())
                .collect();
            let check_failed =
                |index: usize| codes.get(index).copied().flatten() == Some(CHECK_FAILED);
            if check_failed(0) {
                Ok(AppendAttempt::HeadMoved)
            } else if check_failed(1) {
                Ok(AppendAttempt::RowOccupied)
            } else {
                Err(format!("size record transaction cancelled: {codes:?}"))
            }
        })
    }

    fn event_id_at(&self, store_id: &str, timestamp_ms: i64) -> Result<Option<String>, String> {
        let request = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(STORE_ATTR, AttributeValue::S(store_id.to_string()))
            .key(TIMESTAMP_ATTR, AttributeValue::N(timestamp_ms.to_string()))
            .consistent_read(true);

        block_on(async move {
            let output = request
                .send()
                .await
                .map_err(|error| format!("failed to read size record: {error}"))?;
            Ok(output
                .item()
                .and_then(|item| item.get(EVENT_ID_ATTR))
                .and_then(|value| value.as_s().ok())
                .cloned())
        })
    }

    fn query_pages(
        &self,
        build: impl Fn() -> aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder,
        limit: Option<usize>,
    ) -> Result<Vec<SizeRecord>, String> {
        block_on(async move {
            let mut records = Vec::new();
            let mut start_key: Option<Item> = None;
            loop {
                let page = build()
                    .set_exclusive_start_key(start_key.take())
                    .send()
                    .await
                    .map_err(|error| format!("failed to query size records: {error}"))?;

                for item in page.items() {
                    if is_head_item(item) {
                        continue;
                    }
                    records.push(record_from_item(item)?);
                    if limit.is_some_and(|limit| records.len() >= limit) {
                        return Ok(records);
                    }
                }

                match page.last_evaluated_key() {
                    Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                    _ => break,
                }
            }
            Ok(records)
        })
    }
}

impl AggregationTable for DynamoAggregationTable {
    fn append(
        &self,
        record: &SizeRecord,
        previous_ms: Option<i64>,
    ) -> Result<AppendOutcome, String> {
        let mut timestamp_ms = record.timestamp_ms;
        for _ in 0..=MAX_TIMESTAMP_SHIFTS {
            match self.try_append(record, timestamp_ms, previous_ms)? {
                AppendAttempt::Written => return Ok(AppendOutcome::Inserted { timestamp_ms }),
                AppendAttempt::HeadMoved => return Ok(AppendOutcome::Stale),
                AppendAttempt::RowOccupied => {}
            }
            match self.event_id_at(&record.store_id, timestamp_ms)? {
                Some(existing) if existing == record.event_id => {
                    return Ok(AppendOutcome::Duplicate);
                }
                // Deleted between the two calls; the next put may succeed.
                None => continue,
                Some(_) => timestamp_ms += 1,
            }
        }
        Err(format!(
            "no free timestamp for '{}' within {MAX_TIMESTAMP_SHIFTS} ms of {}",
            record.store_id, record.timestamp_ms
        ))
    }

    fn query_store(&self, store_id: &str, since_ms: i64) -> Result<Vec<SizeRecord>, String> {
        let client = self.client.clone();
        let table_name = self.table_name.clone();
        let store_id = store_id.to_string();

        self.query_pages(
            || {
                client
                    .query()
                    .table_name(&table_name)
                    .key_condition_expression("#store = :store AND #ts >= :since")
                    .expression_attribute_names("#store", STORE_ATTR)
                    .expression_attribute_names("#ts", TIMESTAMP_ATTR)
                    .expression_attribute_values(":store", AttributeValue::S(store_id.clone()))
                    .expression_attribute_values(":since", AttributeValue::N(since_ms.to_string()))
                    .consistent_read(true)
                    .scan_index_forward(true)
            },
            None,
        )
    }

    fn query_index(&self, record_type: &str, limit: usize) -> Result<Vec<SizeRecord>, String> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let client = self.client.clone();
        let table_name = self.table_name.clone();
        let index_name = self.index_name.clone();
        let record_type = record_type.to_string();
        let page_limit = i32::try_from(limit).unwrap_or(i32::MAX);

        self.query_pages(
            || {
                client
                    .query()
                    .table_name(&table_name)
                    .index_name(&index_name)
                    .key_condition_expression("#kind = :kind")
                    .expression_attribute_names("#kind", RECORD_TYPE_ATTR)
                    .expression_attribute_values(":kind", AttributeValue::S(record_type.clone()))
                    .scan_index_forward(false)
                    .limit(page_limit)
            },
            Some(limit),
        )
    }

    fn peak_record(&self, record_type: &str, store_id: &str) -> Result<Option<SizeRecord>, String> {
        let client = self.client.clone();
        let table_name = self.table_name.clone();
        let index_name = self.index_name.clone();
        let record_type = record_type.to_string();
        let store_id = store_id.to_string();

        // The filter runs after each page is read, so keep paging until a row
        // of this store turns up.
        let rows = self.query_pages(
            || {
                client
                    .query()
                    .table_name(&table_name)
                    .index_name(&index_name)
                    .key_condition_expression("#kind = :kind")
                    .filter_expression("#store = :store")
                    .expression_attribute_names("#kind", RECORD_TYPE_ATTR)
                    .expression_attribute_names("#store", STORE_ATTR)
                    .expression_attribute_values(":kind", AttributeValue::S(record_type.clone()))
                    .expression_attribute_values(":store", AttributeValue::S(store_id.clone()))
                    .scan_index_forward(false)
                    .limit(PEAK_PAGE_SIZE)
            },
            Some(1),
        )?;
        Ok(rows.into_iter().next())
    }
}

fn item_from_record(record: &SizeRecord, timestamp_ms: i64) -> Item {
    HashMap::from([
        (STORE_ATTR.to_string(), AttributeValue::S(record.store_id.clone())),
        (TIMESTAMP_ATTR.to_string(), AttributeValue::N(timestamp_ms.to_string())),
        (EVENT_ID_ATTR.to_string(), AttributeValue::S(record.event_id.clone())),
        (OBJECT_KEY_ATTR.to_string(), AttributeValue::S(record.object_key.clone())),
        (
            EVENT_TYPE_ATTR.to_string(),
            AttributeValue::S(record.event_type.as_str().to_string()),
        ),
        (SIZE_DELTA_ATTR.to_string(), AttributeValue::N(record.size_delta.to_string())),
        (TOTAL_SIZE_ATTR.to_string(), AttributeValue::N(record.total_size.to_string())),
        (
            OBJECT_COUNT_ATTR.to_string(),
            AttributeValue::N(record.object_count.to_string()),
        ),
        (RECORD_TYPE_ATTR.to_string(), AttributeValue::S(record.record_type.clone())),
    ])
}

fn record_from_item(item: &Item) -> Result<SizeRecord, String> {
    Ok(SizeRecord {
        store_id: string_attr(item, STORE_ATTR)?,
        timestamp_ms: number_attr(item, TIMESTAMP_ATTR)?,
        event_id: string_attr(item, EVENT_ID_ATTR)?,
        object_key: string_attr(item, OBJECT_KEY_ATTR)?,
        event_type: ChangeKind::parse(&string_attr(item, EVENT_TYPE_ATTR)?)
            .map_err(|error| error.to_string())?,
        size_delta: number_attr(item, SIZE_DELTA_ATTR)?,
        total_size: number_attr(item, TOTAL_SIZE_ATTR)?,
        object_count: number_attr(item, OBJECT_COUNT_ATTR)?,
        record_type: string_attr(item, RECORD_TYPE_ATTR)?,
    })
}

fn is_head_item(item: &Item) -> bool {
    number_attr::<i64>(item, TIMESTAMP_ATTR).ok() == Some(HEAD_TIMESTAMP)
}

fn string_attr(item: &Item, name: &str) -> Result<String, String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| format!("size record is missing string attribute '{name}'"))
}

fn number_attr<T: std::str::FromStr>(item: &Item, name: &str) -> Result<T, String> {
    let raw = item
        .get(name)
        .and_then(|value| value.as_n().ok())
        .ok_or_else(|| format!("size record is missing number attribute '{name}'"))?;
    raw.parse()
        .map_err(|_| format!("size record attribute '{name}' is not a valid number: {raw}"))
}

#[cfg(test)]
mod tests {
    use bucket_watch_core::contract::SIZE_RECORD_TYPE;

    use super::*;

    #[test]
    fn item_conversion_preserves_every_field() {
        let record = SizeRecord {
            store_id: "watch-bucket".to_string(),
            timestamp_ms: 1_700_000_000_123,
            event_id: "abc".to_string(),
            object_key: "assignment1.txt".to_string(),
            event_type: ChangeKind::Removed,
            size_delta: -19,
            total_size: 30,
            object_count: 2,
            record_type: SIZE_RECORD_TYPE.to_string(),
        };

        let item = item_from_record(&record, record.timestamp_ms + 1);
        let restored = record_from_item(&item).expect("item should convert back");

        assert_eq!(restored.timestamp_ms, record.timestamp_ms + 1);
        assert_eq!(restored.size_delta, -19);
        assert_eq!(restored.event_type, ChangeKind::Removed);
        assert_eq!(restored.object_key, record.object_key);
    }

    #[test]
    fn missing_attribute_is_reported() {
        let mut item = item_from_record(
            &SizeRecord {
                store_id: "b".to_string(),
                timestamp_ms: 1,
                event_id: "e".to_string(),
                object_key: "k".to_string(),
                event_type: ChangeKind::Created,
                size_delta: 1,
                total_size: 1,
                object_count: 1,
                record_type: SIZE_RECORD_TYPE.to_string(),
            },
            1,
        );
        item.remove(TOTAL_SIZE_ATTR);

        let error = record_from_item(&item).expect_err("total_size is required");
        assert!(error.contains("total_size"));
    }

    #[test]
    fn head_item_is_not_a_size_record() {
        let head = HashMap::from([
            (STORE_ATTR.to_string(), AttributeValue::S("b".to_string())),
            (TIMESTAMP_ATTR.to_string(), AttributeValue::N(HEAD_TIMESTAMP.to_string())),
            (LATEST_ATTR.to_string(), AttributeValue::N("1000".to_string())),
        ]);

        assert!(is_head_item(&head));
        assert!(!is_head_item(&item_from_record(
            &SizeRecord {
                store_id: "b".to_string(),
                timestamp_ms: 1_000,
                event_id: "e".to_string(),
                object_key: "k".to_string(),
                event_type: ChangeKind::Created,
                size_delta: 1,
                total_size: 1,
                object_count: 1,
                record_type: SIZE_RECORD_TYPE.to_string(),
            },
            1_000,
        )));
    }
}
