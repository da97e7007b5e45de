use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::{BrokerError, TopicMessage, ValueStream};

/// Hard cap on samples per collection, matching the upstream data plane's
/// limit on trend queries.
pub const MAX_SAMPLES: usize = 100;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no message received on {topic} before the timeout")]
    Timeout { topic: String },
    #[error("broker connection lost on {topic}")]
    Disconnect { topic: String },
    #[error("live data collection is disabled")]
    Disabled,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Coordinator for the process-wide live-data switch.
///
/// Disabling cancels every in-progress collection through the shared token
/// and makes new collections fail fast with [`CollectorError::Disabled`].
/// Re-enabling arms a fresh token.
pub struct CollectionGate {
    state: Mutex<GateState>,
}

struct GateState {
    enabled: bool,
    token: CancellationToken,
}

impl CollectionGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                enabled: true,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Returns the resulting state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let mut state = self.state.lock().expect("gate lock");
        if enabled && !state.enabled {
            state.token = CancellationToken::new();
        }
        if !enabled {
            state.token.cancel();
        }
        state.enabled = enabled;
        enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().expect("gate lock").enabled
    }

    fn admit(&self) -> Result<CancellationToken, CollectorError> {
        let state = self.state.lock().expect("gate lock");
        if !state.enabled {
            return Err(CollectorError::Disabled);
        }
        Ok(state.token.clone())
    }
}

impl Default for CollectionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One collected value with its source timestamp (epoch milliseconds).
#[derive(Debug, Clone)]
pub struct Sample {
    pub value: Value,
    pub timestamp_ms: i64,
}

impl Sample {
    /// Payloads missing either field (or carrying a null value) are not
    /// samples and are skipped.
    fn from_message(message: &TopicMessage) -> Option<Self> {
        let value = match message.payload.get("value") {
            None | Some(Value::Null) => return None,
            Some(value) => value.clone(),
        };
        let timestamp_ms = message.payload.get("timestamp")?.as_i64()?;
        Some(Self {
            value,
            timestamp_ms,
        })
    }

    pub fn human_timestamp(&self) -> String {
        DateTime::from_timestamp_millis(self.timestamp_ms)
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_default()
    }
}

enum StopReason {
    Complete,
    TimedOut,
    Disconnected,
    Cancelled,
}

/// Builds "current value" and "N sequential values" semantics on top of a
/// [`ValueStream`]. Every call is one subscribe/receive*/unsubscribe cycle;
/// the subscription is released on every exit path.
pub struct Collector {
    stream: Arc<dyn ValueStream>,
}

impl Collector {
    pub fn new(stream: Arc<dyn ValueStream>) -> Self {
        Self { stream }
    }

    /// Wait for the next message published on `topic`, or time out.
    pub async fn current(
        &self,
        gate: &CollectionGate,
        topic: &str,
        timeout: Duration,
    ) -> Result<TopicMessage, CollectorError> {
        let cancel = gate.admit()?;
        let mut subscription = self.stream.subscribe(topic).await?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CollectorError::Disabled),
            _ = tokio::time::sleep(timeout) => Err(CollectorError::Timeout {
                topic: topic.to_string(),
            }),
            message = subscription.next_message() => message.ok_or_else(|| {
                CollectorError::Disconnect {
                    topic: topic.to_string(),
                }
            }),
        };

        subscription.unsubscribe().await;
        outcome
    }

    /// Collect up to `n` samples in arrival order.
    ///
    /// A short (non-empty) sequence is a valid outcome: collection stops on
    /// the per-message gap timeout, the overall deadline, broker disconnect,
    /// or gate cancellation, and returns whatever arrived by then. Only a
    /// timeout that produced nothing at all is reported as an error.
    pub async fn collect_n(
        &self,
        gate: &CollectionGate,
        topic: &str,
        n: usize,
        per_message_timeout: Duration,
        overall_timeout: Duration,
    ) -> Result<Vec<Sample>, CollectorError> {
        let cancel = gate.admit()?;
        let n = if n > MAX_SAMPLES {
            tracing::warn!(requested = n, cap = MAX_SAMPLES, "sample count capped");
            MAX_SAMPLES
        } else {
            n
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut subscription = self.stream.subscribe(topic).await?;
        let deadline = tokio::time::Instant::now() + overall_timeout;
        let mut samples = Vec::with_capacity(n);

        let reason = loop {
            if samples.len() >= n {
                break StopReason::Complete;
            }
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StopReason::TimedOut,
                _ = tokio::time::sleep(per_message_timeout) => break StopReason::TimedOut,
                message = subscription.next_message() => match message {
                    Some(message) => {
                        if let Some(sample) = Sample::from_message(&message) {
                            samples.push(sample);
                        }
                    }
                    None => break StopReason::Disconnected,
                },
            }
        };

        subscription.unsubscribe().await;

        match reason {
            StopReason::TimedOut if samples.is_empty() => Err(CollectorError::Timeout {
                topic: topic.to_string(),
            }),
            StopReason::Cancelled => {
                tracing::info!(topic, collected = samples.len(), "collection preempted");
                Ok(samples)
            }
            StopReason::Disconnected => {
                tracing::warn!(topic, collected = samples.len(), "broker disconnected mid-collection");
                Ok(samples)
            }
            StopReason::Complete | StopReason::TimedOut => Ok(samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryValueStream;
    use serde_json::json;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<MemoryValueStream>, Collector, CollectionGate) {
        let stream = Arc::new(MemoryValueStream::new());
        let collector = Collector::new(stream.clone());
        (stream, collector, CollectionGate::new())
    }

    fn sample_payload(value: i64) -> Value {
        json!({ "value": value, "timestamp": 1_700_000_000_000i64 + value })
    }

    #[tokio::test]
    async fn collect_returns_partial_sequence_on_disconnect() {
        let (stream, collector, gate) = setup();

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for value in [1, 2, 3] {
                publisher.publish("plant/line1/temp", sample_payload(value));
            }
            publisher.close_topic("plant/line1/temp");
        });

        let samples = collector
            .collect_n(&gate, "plant/line1/temp", 5, LONG, LONG)
            .await
            .expect("partial result is not an error");

        let values: Vec<i64> = samples.iter().filter_map(|s| s.value.as_i64()).collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(stream.active_subscriptions(), 0);

        // The subscription was released: a following subscribe succeeds.
        let sub = stream.subscribe("plant/line1/temp").await.expect("re-subscribe");
        assert_eq!(stream.active_subscriptions(), 1);
        sub.unsubscribe().await;
    }

    #[tokio::test]
    async fn disabling_gate_preempts_in_progress_collection() {
        let (stream, collector, gate) = setup();
        let gate = Arc::new(gate);

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("plant/press", sample_payload(7));
            publisher.publish("plant/press", sample_payload(8));
        });

        let toggler = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            toggler.set_enabled(false);
        });

        let samples = tokio::time::timeout(
            Duration::from_secs(2),
            collector.collect_n(&gate, "plant/press", 50, LONG, LONG),
        )
        .await
        .expect("preemption must return within the grace period")
        .expect("preempted collection returns its partial sequence");

        assert_eq!(samples.len(), 2);
        assert_eq!(stream.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn disabled_gate_refuses_new_collections() {
        let (_stream, collector, gate) = setup();
        gate.set_enabled(false);

        let err = collector
            .collect_n(&gate, "plant/any", 1, SHORT, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Disabled));

        // Re-enabling arms a fresh token, so later collections run again.
        gate.set_enabled(true);
        let err = collector
            .collect_n(&gate, "plant/any", 1, SHORT, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_collection_after_timeout_is_an_error() {
        let (_stream, collector, gate) = setup();
        let err = collector
            .collect_n(&gate, "plant/silent", 3, SHORT, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn current_returns_the_next_published_message() {
        let (stream, collector, gate) = setup();

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("plant/flow", json!({ "value": 42.5, "timestamp": 1 }));
        });

        let message = collector
            .current(&gate, "plant/flow", LONG)
            .await
            .expect("message arrives");
        assert_eq!(message.payload["value"], json!(42.5));
        assert_eq!(stream.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn current_times_out_without_a_publisher() {
        let (stream, collector, gate) = setup();
        let err = collector.current(&gate, "plant/silent", SHORT).await.unwrap_err();
        assert!(matches!(err, CollectorError::Timeout { .. }));
        assert_eq!(stream.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn sample_count_is_capped() {
        let (stream, collector, gate) = setup();

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for value in 0..120 {
                publisher.publish("plant/burst", sample_payload(value));
            }
        });

        let samples = collector
            .collect_n(&gate, "plant/burst", 120, LONG, LONG)
            .await
            .expect("capped collection completes");
        assert_eq!(samples.len(), MAX_SAMPLES);
    }

    #[tokio::test]
    async fn messages_missing_fields_are_skipped() {
        let (stream, collector, gate) = setup();

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("plant/mixed", json!({ "timestamp": 5 }));
            publisher.publish("plant/mixed", json!({ "value": null, "timestamp": 6 }));
            publisher.publish("plant/mixed", sample_payload(9));
        });

        let samples = collector
            .collect_n(&gate, "plant/mixed", 1, LONG, LONG)
            .await
            .expect("one valid sample");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, json!(9));
    }
}
