//! Live topic sampling tools exposed to the agent, built on the broker
//! collector. Each invocation is one subscribe/receive*/unsubscribe cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use edge_relay_broker::{CollectionGate, Collector, CollectorError, MAX_SAMPLES};
use edge_relay_error::RelayError;

use super::{Tool, ToolError};

/// Collector failures become agent-visible tool outcomes, phrased through
/// the relay's shared error taxonomy.
fn collector_failure(err: CollectorError) -> ToolError {
    let relay_err = match err {
        CollectorError::Timeout { topic } => RelayError::BrokerTimeout { topic },
        CollectorError::Disconnect { topic } => RelayError::BrokerDisconnect { topic },
        CollectorError::Disabled => RelayError::LiveDataDisabled,
        CollectorError::Broker(err) => return ToolError::Failed(err.to_string()),
    };
    ToolError::Failed(relay_err.to_string())
}

fn required_topic(args: &Value) -> Result<String, ToolError> {
    args.get("topic")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Invalid("'topic' parameter is required".to_string()))
}

fn timeout_override(args: &Value, default: Duration) -> Duration {
    args.get("timeout_seconds")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Waits for the next message published to a topic and returns it.
pub struct CurrentValueTool {
    collector: Arc<Collector>,
    gate: Arc<CollectionGate>,
    timeout: Duration,
}

impl CurrentValueTool {
    pub fn new(collector: Arc<Collector>, gate: Arc<CollectionGate>, timeout: Duration) -> Self {
        Self {
            collector,
            gate,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for CurrentValueTool {
    fn name(&self) -> &str {
        "get_current_value_on_topic"
    }

    fn description(&self) -> &str {
        "Subscribes to a live data topic and returns the next published message. \
         Use this to read the current value of a sensor or tag."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "Topic to read, e.g. 'plant/line1/temperature'",
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Optional: seconds to wait for a message",
                },
            },
            "required": ["topic"],
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let topic = required_topic(&args)?;
        let timeout = timeout_override(&args, self.timeout);

        let message = self
            .collector
            .current(&self.gate, &topic, timeout)
            .await
            .map_err(collector_failure)?;

        tracing::info!(topic = %topic, "retrieved current topic value");
        Ok(json!({
            "topic": topic,
            "data": message.payload,
        }))
    }
}

/// Collects multiple sequential values from a topic for trend analysis.
pub struct CollectValuesTool {
    collector: Arc<Collector>,
    gate: Arc<CollectionGate>,
    per_message_timeout: Duration,
    overall_timeout: Duration,
}

impl CollectValuesTool {
    pub fn new(
        collector: Arc<Collector>,
        gate: Arc<CollectionGate>,
        per_message_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            collector,
            gate,
            per_message_timeout,
            overall_timeout,
        }
    }
}

#[async_trait]
impl Tool for CollectValuesTool {
    fn name(&self) -> &str {
        "collect_values_from_topic"
    }

    fn description(&self) -> &str {
        "Collects up to num_samples sequential values from a live data topic, \
         in arrival order, for trend analysis. Returns whatever arrived before \
         the timeout; a short sequence is normal."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "Topic to sample, e.g. 'plant/line1/temperature'",
                },
                "num_samples": {
                    "type": "integer",
                    "description": format!("Samples to collect (max {MAX_SAMPLES}, default 10)"),
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Optional: overall seconds to spend collecting",
                },
            },
            "required": ["topic"],
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let topic = required_topic(&args)?;
        let num_samples = args
            .get("num_samples")
            .and_then(|v| v.as_u64())
            .unwrap_or(10) as usize;
        let overall = timeout_override(&args, self.overall_timeout);

        let samples = self
            .collector
            .collect_n(&self.gate, &topic, num_samples, self.per_message_timeout, overall)
            .await
            .map_err(collector_failure)?;

        tracing::info!(topic = %topic, collected = samples.len(), "collected topic samples");

        let values: Vec<Value> = samples.iter().map(|s| s.value.clone()).collect();
        let timestamps: Vec<String> = samples.iter().map(|s| s.human_timestamp()).collect();
        Ok(json!({
            "topic": topic,
            "num_samples": samples.len(),
            "values": values,
            "timestamps": timestamps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_relay_broker::MemoryValueStream;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<MemoryValueStream>, Arc<Collector>, Arc<CollectionGate>) {
        let stream = Arc::new(MemoryValueStream::new());
        let collector = Arc::new(Collector::new(stream.clone()));
        (stream, collector, Arc::new(CollectionGate::new()))
    }

    #[tokio::test]
    async fn collect_tool_returns_values_and_timestamps_in_arrival_order() {
        let (stream, collector, gate) = setup();
        let tool = CollectValuesTool::new(collector, gate, LONG, LONG);

        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for value in [3, 1, 2] {
                publisher.publish(
                    "plant/seq",
                    json!({ "value": value, "timestamp": 1_700_000_000_000i64 }),
                );
            }
        });

        let result = tool
            .invoke(json!({ "topic": "plant/seq", "num_samples": 3 }))
            .await
            .expect("collection succeeds");
        assert_eq!(result["num_samples"], 3);
        assert_eq!(result["values"], json!([3, 1, 2]));
        assert_eq!(result["timestamps"].as_array().map(|a| a.len()), Some(3));
    }

    #[tokio::test]
    async fn collect_tool_reports_a_timeout_when_nothing_arrives() {
        let (_stream, collector, gate) = setup();
        let tool = CollectValuesTool::new(collector, gate, SHORT, SHORT);

        let err = tool
            .invoke(json!({ "topic": "plant/silent" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn tools_refuse_when_live_data_is_disabled() {
        let (_stream, collector, gate) = setup();
        gate.set_enabled(false);
        let tool = CurrentValueTool::new(collector, gate, SHORT);

        let err = tool.invoke(json!({ "topic": "plant/any" })).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn missing_topic_is_an_invalid_argument() {
        let (_stream, collector, gate) = setup();
        let tool = CurrentValueTool::new(collector, gate, SHORT);

        let err = tool.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Invalid(_)));
    }
}
