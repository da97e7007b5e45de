use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {message}")]
    Connect { message: String },
    #[error("subscribe failed on {topic}: {message}")]
    Subscribe { topic: String, message: String },
}

/// One message received from a subscribed topic, payload decoded as JSON.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Value,
}

/// A live subscription. `next_message` returning `None` means the broker
/// connection is gone; `unsubscribe` must be called on every exit path.
#[async_trait]
pub trait TopicSubscription: Send {
    async fn next_message(&mut self) -> Option<TopicMessage>;
    async fn unsubscribe(self: Box<Self>);
}

#[async_trait]
pub trait ValueStream: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError>;
}

/// Connection parameters for the production NATS-backed stream.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn server_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

/// NATS-backed stream. Each subscription is its own connection, opened when
/// the collection cycle starts and torn down with the unsubscribe, so a
/// broker that is down never blocks startup, only the tool call that needed
/// it.
pub struct NatsValueStream {
    config: BrokerConfig,
}

impl NatsValueStream {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ValueStream for NatsValueStream {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError> {
        let mut options = async_nats::ConnectOptions::new();
        if let (Some(user), Some(password)) = (&self.config.username, &self.config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }
        let client = options
            .connect(self.config.server_url())
            .await
            .map_err(|err| BrokerError::Connect {
                message: err.to_string(),
            })?;

        let subscriber =
            client
                .subscribe(topic.to_string())
                .await
                .map_err(|err| BrokerError::Subscribe {
                    topic: topic.to_string(),
                    message: err.to_string(),
                })?;
        tracing::debug!(topic, server = %self.config.server_url(), "subscribed");
        Ok(Box::new(NatsSubscription {
            topic: topic.to_string(),
            client,
            inner: subscriber,
        }))
    }
}

struct NatsSubscription {
    topic: String,
    client: async_nats::Client,
    inner: async_nats::Subscriber,
}

#[async_trait]
impl TopicSubscription for NatsSubscription {
    async fn next_message(&mut self) -> Option<TopicMessage> {
        loop {
            let message = self.inner.next().await?;
            match serde_json::from_slice::<Value>(&message.payload) {
                Ok(payload) => {
                    return Some(TopicMessage {
                        topic: message.subject.to_string(),
                        payload,
                    })
                }
                Err(err) => {
                    // Non-JSON payloads are skipped, not fatal.
                    tracing::debug!(topic = %self.topic, error = %err, "discarding undecodable message");
                }
            }
        }
    }

    async fn unsubscribe(mut self: Box<Self>) {
        if let Err(err) = self.inner.unsubscribe().await {
            tracing::warn!(topic = %self.topic, error = %err, "unsubscribe failed");
        }
        // Closing the per-cycle connection releases the broker side promptly.
        if let Err(err) = self.client.flush().await {
            tracing::debug!(topic = %self.topic, error = %err, "flush on close failed");
        }
    }
}
