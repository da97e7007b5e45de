//! Channel-backed [`ValueStream`] used by tests and by deployments without a
//! reachable broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::client::{BrokerError, TopicMessage, TopicSubscription, ValueStream};

const TOPIC_BUFFER: usize = 256;

#[derive(Default)]
pub struct MemoryValueStream {
    topics: Mutex<HashMap<String, broadcast::Sender<TopicMessage>>>,
    active: Arc<AtomicUsize>,
}

impl MemoryValueStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a JSON payload to everyone currently subscribed to `topic`.
    pub fn publish(&self, topic: &str, payload: Value) {
        let topics = self.topics.lock().expect("topics lock");
        if let Some(sender) = topics.get(topic) {
            let _ = sender.send(TopicMessage {
                topic: topic.to_string(),
                payload,
            });
        }
    }

    /// Simulate the broker dropping a topic: subscribers observe end-of-stream.
    pub fn close_topic(&self, topic: &str) {
        self.topics.lock().expect("topics lock").remove(topic);
    }

    /// Subscriptions that have been opened and not yet unsubscribed.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValueStream for MemoryValueStream {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError> {
        let receiver = {
            let mut topics = self.topics.lock().expect("topics lock");
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
                .subscribe()
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            receiver,
            active: self.active.clone(),
        }))
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<TopicMessage>,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl TopicSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<TopicMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
