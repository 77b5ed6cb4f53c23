use bucket_watch_core::contract::ValidationError;

pub mod alarm;
pub mod cleaner;
pub mod driver;
pub mod logging;
pub mod queue_event;
pub mod reporting;
pub mod size_tracking;

/// Failure of a handler invocation. For queue consumers this fails the whole
/// batch so every message in it is redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<ValidationError> for HandlerError {
    fn from(error: ValidationError) -> Self {
        Self::new(error.message())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
