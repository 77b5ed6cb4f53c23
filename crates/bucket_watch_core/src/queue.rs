//! At-least-once work queue with a visibility timeout.
//!
//! Received messages stay in the queue, hidden, until their receipt is
//! deleted. A batch that is never acknowledged becomes visible again once the
//! timeout elapses and is delivered with a fresh receipt handle.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::contract::{ValidationError, DEFAULT_VISIBILITY_TIMEOUT_SECS, MAX_RECEIVE_BATCH_SIZE};
use crate::fanout::Subscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub visibility_timeout_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_RECEIVE_BATCH_SIZE,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS as i64,
        }
    }
}

impl QueueConfig {
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.batch_size == 0 || self.batch_size > MAX_RECEIVE_BATCH_SIZE {
            return Err(ValidationError::new(format!(
                "batch_size must be between 1 and {MAX_RECEIVE_BATCH_SIZE}"
            )));
        }
        if self.visibility_timeout_secs <= 0 {
            return Err(ValidationError::new(
                "visibility_timeout_secs must be positive",
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    Acknowledged { messages: usize },
    Failed { messages: usize, error: String },
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: i64,
    receive_count: u32,
    receipt_handle: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    clock_secs: i64,
    next_message_id: u64,
    next_receipt: u64,
}

#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            name: name.into(),
            config: config.validate()?,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Moves the queue's notion of "now" forward; sends without an explicit
    /// time are stamped with it.
    pub fn set_clock(&self, now_secs: i64) -> Result<(), String> {
        let mut state = self.lock()?;
        state.clock_secs = state.clock_secs.max(now_secs);
        Ok(())
    }

    pub fn send(&self, body: impl Into<String>, now_secs: i64) -> Result<String, String> {
        let mut state = self.lock()?;
        state.next_message_id += 1;
        let message_id = format!("{}-{}", self.name, state.next_message_id);
        state.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            visible_at: now_secs,
            receive_count: 0,
            receipt_handle: None,
        });
        Ok(message_id)
    }

    pub fn receive(&self, now_secs: i64) -> Result<Vec<QueueMessage>, String> {
        let mut state = self.lock()?;
        let hidden_until = now_secs + self.config.visibility_timeout_secs;
        let mut batch = Vec::with_capacity(self.config.batch_size);

        let QueueState {
            messages,
            next_receipt,
            ..
        } = &mut *state;

        for message in messages.iter_mut() {
            if batch.len() == self.config.batch_size {
                break;
            }
            if message.visible_at > now_secs {
                continue;
            }
            *next_receipt += 1;
            let receipt_handle = format!("{}#{}", message.message_id, next_receipt);
            message.visible_at = hidden_until;
            message.receive_count += 1;
            message.receipt_handle = Some(receipt_handle.clone());
            batch.push(QueueMessage {
                message_id: message.message_id.clone(),
                receipt_handle,
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }

        Ok(batch)
    }

    /// Returns whether a message was removed. A receipt from an earlier,
    /// expired receive no longer matches and is ignored.
    pub fn delete(&self, receipt_handle: &str) -> Result<bool, String> {
        let mut state = self.lock()?;
        let position = state
            .messages
            .iter()
            .position(|message| message.receipt_handle.as_deref() == Some(receipt_handle));
        Ok(match position {
            Some(index) => state.messages.remove(index).is_some(),
            None => false,
        })
    }

    /// Receives one batch and hands the whole batch to `processor`; the batch
    /// is deleted only if processing succeeds.
    pub fn drain_batch(
        &self,
        now_secs: i64,
        processor: &mut dyn FnMut(&[QueueMessage]) -> Result<(), String>,
    ) -> Result<DrainOutcome, String> {
        let batch = self.receive(now_secs)?;
        if batch.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        if let Err(error) = processor(&batch) {
            return Ok(DrainOutcome::Failed {
                messages: batch.len(),
                error,
            });
        }

        for message in &batch {
            self.delete(&message.receipt_handle)?;
        }
        Ok(DrainOutcome::Acknowledged {
            messages: batch.len(),
        })
    }

    pub fn len(&self) -> Result<usize, String> {
        Ok(self.lock()?.messages.len())
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }

    pub fn visible_len(&self, now_secs: i64) -> Result<usize, String> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|message| message.visible_at <= now_secs)
            .count())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, String> {
        self.state
            .lock()
            .map_err(|_| format!("queue '{}' state lock poisoned", self.name))
    }
}

impl Subscriber for WorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, message: &str) -> Result<(), String> {
        let now_secs = self.lock()?.clock_secs;
        self.send(message, now_secs).map(|_| ())
    }
}
