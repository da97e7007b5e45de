use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use crate::session::Exchange;
use crate::tools::{ResourceDescriptor, ToolDescriptor};

use super::{AgentRuntime, ReplyStream, RuntimeError};

const MOCK_MODEL_ID: &str = "mock-model";
const REPLY_BUFFER: usize = 32;

/// One scripted reply. Fragments stream in order; an optional `hold` keeps
/// the turn open until notified; an optional `error` terminates the stream
/// after the fragments.
#[derive(Default)]
pub struct MockTurn {
    pub fragments: Vec<String>,
    pub hold: Option<Arc<Notify>>,
    pub error: Option<String>,
}

impl MockTurn {
    pub fn reply(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn held(fragments: &[&str], hold: Arc<Notify>) -> Self {
        Self {
            hold: Some(hold),
            ..Self::reply(fragments)
        }
    }

    pub fn failing(fragments: &[&str], error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::reply(fragments)
        }
    }
}

/// Scripted runtime used by the HTTP tests and as the credential-free
/// runtime mode. Turns are consumed in order; once the script runs dry every
/// query gets an echo reply.
pub struct MockRuntime {
    turns: Mutex<VecDeque<MockTurn>>,
    catalog_fetches: Arc<AtomicUsize>,
    catalog_available: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            catalog_fetches: Arc::new(AtomicUsize::new(0)),
            catalog_available: true,
        }
    }

    pub fn without_catalog() -> Self {
        Self {
            catalog_available: false,
            ..Self::new()
        }
    }

    pub fn script(self, turns: Vec<MockTurn>) -> Self {
        *self.turns.lock().expect("turns lock") = turns.into();
        self
    }

    /// How often the catalog has been fetched from this runtime.
    pub fn catalog_fetches(&self) -> Arc<AtomicUsize> {
        self.catalog_fetches.clone()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn model_id(&self) -> String {
        MOCK_MODEL_ID.to_string()
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RuntimeError> {
        self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.catalog_available {
            return Err(RuntimeError::Unavailable(
                "mock catalog disabled".to_string(),
            ));
        }
        Ok(vec![ToolDescriptor {
            name: "mock_tool".to_string(),
            description: "A scripted tool.".to_string(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
        }])
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, RuntimeError> {
        if !self.catalog_available {
            return Err(RuntimeError::Unavailable(
                "mock catalog disabled".to_string(),
            ));
        }
        Ok(vec![ResourceDescriptor {
            name: "Mock Docs".to_string(),
            description: "Scripted documentation entry.".to_string(),
            uri: "edge://docs/mock".to_string(),
            url: "https://docs.example.invalid/mock".to_string(),
            mime_type: "text/html".to_string(),
        }])
    }

    fn stream_reply(&self, _history: &[Exchange], query: &str) -> ReplyStream {
        let turn = self
            .turns
            .lock()
            .expect("turns lock")
            .pop_front()
            .unwrap_or_else(|| MockTurn::reply(&["echo: ", query]));

        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        tokio::spawn(async move {
            for fragment in turn.fragments {
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
            if let Some(hold) = turn.hold {
                hold.notified().await;
            }
            if let Some(error) = turn.error {
                let _ = tx.send(Err(RuntimeError::Request(error))).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}
