use std::sync::Arc;

/// A destination the topic broadcasts to.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, message: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscriber: String,
    pub error: String,
}

impl PublishReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Broadcasts every published message to every current subscriber.
#[derive(Default, Clone)]
pub struct Topic {
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl Topic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn publish(&self, message: &str) -> PublishReport {
        let mut report = PublishReport::default();
        for subscriber in &self.subscribers {
            match subscriber.deliver(message) {
                Ok(()) => report.delivered.push(subscriber.name().to_string()),
                Err(error) => report.failed.push(DeliveryFailure {
                    subscriber: subscriber.name().to_string(),
                    error,
                }),
            }
        }
        report
    }
}
