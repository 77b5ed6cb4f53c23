use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SIZE_RECORD_TYPE: &str = "SIZE_RECORD";
pub const DEFAULT_INDEX_NAME: &str = "AllBucketsIndex";
pub const MAX_RECEIVE_BATCH_SIZE: usize = 10;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Removed,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "created" => Ok(Self::Created),
            "removed" => Ok(Self::Removed),
            other => Err(ValidationError::new(format!(
                "unknown change kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

/// A create or remove notification for a single object.
///
/// `sequencer` is the store-assigned ordering token when the store provides
/// one; redeliveries of the same notification carry the same value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub store_id: String,
    pub object_key: String,
    pub event_type: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<String>,
}

impl ChangeEvent {
    pub fn created(
        store_id: impl Into<String>,
        object_key: impl Into<String>,
        size: u64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            object_key: object_key.into(),
            event_type: ChangeKind::Created,
            size: Some(size),
            timestamp_ms,
            sequencer: None,
        }
    }

    pub fn removed(
        store_id: impl Into<String>,
        object_key: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            object_key: object_key.into(),
            event_type: ChangeKind::Removed,
            size: None,
            timestamp_ms,
            sequencer: None,
        }
    }

    pub fn with_sequencer(mut self, sequencer: impl Into<String>) -> Self {
        self.sequencer = Some(sequencer.into());
        self
    }

    /// Stable identity shared by every delivery of the same notification.
    pub fn event_id(&self) -> String {
        let ordering = self
            .sequencer
            .clone()
            .unwrap_or_else(|| self.timestamp_ms.to_string());

        let mut hasher = Sha256::new();
        for part in [
            self.store_id.as_str(),
            self.object_key.as_str(),
            self.event_type.as_str(),
            ordering.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1_000)
    }
}

/// One append-only row of the aggregation table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeRecord {
    pub store_id: String,
    pub timestamp_ms: i64,
    pub event_id: String,
    pub object_key: String,
    pub event_type: ChangeKind,
    pub size_delta: i64,
    pub total_size: u64,
    pub object_count: u64,
    pub record_type: String,
}

/// Structured log line emitted by the logging consumer.
///
/// The metric filter only looks at `size_delta`; the other fields make the
/// line searchable when resolving removal sizes and deduplicating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeLogRecord {
    pub object_name: String,
    pub size_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
}

impl SizeLogRecord {
    pub fn to_line(&self) -> Result<String, String> {
        serde_json::to_string(self)
            .map_err(|error| format!("failed to serialize size log record: {error}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}
