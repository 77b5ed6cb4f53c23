use std::collections::BTreeMap;
use std::sync::Mutex;

use bucket_watch_core::contract::{ChangeEvent, StoredObject};
use bucket_watch_core::fanout::{PublishReport, Topic};
use bucket_watch_core::notification::encode_topic_message;

pub trait ObjectStore {
    fn bucket(&self) -> &str;
    fn put_object(&self, key: &str, body: &[u8], content_type: Option<&str>)
        -> Result<(), String>;
    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    /// Deleting a key that does not exist succeeds.
    fn delete_object(&self, key: &str) -> Result<(), String>;
    fn list_objects(&self) -> Result<Vec<StoredObject>, String>;
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<String, Vec<u8>>,
    clock_ms: i64,
    sequence: u64,
    publish_failures: Vec<String>,
}

/// Bucket held in memory that announces every change on a topic.
pub struct InMemoryObjectStore {
    bucket: String,
    topic: Topic,
    state: Mutex<BucketState>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>, topic: Topic) -> Self {
        Self {
            bucket: bucket.into(),
            topic,
            state: Mutex::new(BucketState::default()),
        }
    }

    /// Sets the timestamp stamped on subsequent change events.
    pub fn set_clock(&self, now_ms: i64) -> Result<(), String> {
        let mut state = self.lock()?;
        state.clock_ms = state.clock_ms.max(now_ms);
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>, String> {
        Ok(self.lock()?.objects.keys().cloned().collect())
    }

    pub fn publish_failures(&self) -> Result<Vec<String>, String> {
        Ok(self.lock()?.publish_failures.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BucketState>, String> {
        self.state
            .lock()
            .map_err(|_| format!("bucket '{}' state lock poisoned", self.bucket))
    }

    fn announce(&self, state: &mut BucketState, event: ChangeEvent) -> Result<(), String> {
        state.sequence += 1;
        let event = event.with_sequencer(format!("{:016X}", state.sequence));
        let message_id = format!("{}-{}", self.bucket, state.sequence);
        let message = encode_topic_message(&event, &message_id)?;
        let report: PublishReport = self.topic.publish(&message);
        for failure in report.failed {
            state
                .publish_failures
                .push(format!("{}: {}", failure.subscriber, failure.error));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(
        &self,
        key: &str,
        body: &[u8],
        _content_type: Option<&str>,
    ) -> Result<(), String> {
        let mut state = self.lock()?;
        state.objects.insert(key.to_string(), body.to_vec());
        let event = ChangeEvent::created(&self.bucket, key, body.len() as u64, state.clock_ms);
        self.announce(&mut state, event)
    }

    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.lock()?.objects.get(key).cloned())
    }

    fn delete_object(&self, key: &str) -> Result<(), String> {
        let mut state = self.lock()?;
        if state.objects.remove(key).is_none() {
            return Ok(());
        }
        let event = ChangeEvent::removed(&self.bucket, key, state.clock_ms);
        self.announce(&mut state, event)
    }

    fn list_objects(&self) -> Result<Vec<StoredObject>, String> {
        Ok(self
            .lock()?
            .objects
            .iter()
            .map(|(key, body)| StoredObject {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }
}
