//! The agent runtime contract the relay streams from, plus its two
//! implementations: the Claude-backed production runtime and a scripted mock.

mod claude;
mod mock;

pub use claude::{ClaudeConfig, ClaudeRuntime, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use mock::{MockRuntime, MockTurn};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::session::Exchange;
use crate::tools::{ResourceDescriptor, ToolDescriptor};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("agent request failed: {0}")]
    Request(String),
    #[error("agent response invalid: {0}")]
    Protocol(String),
    #[error("tool loop exceeded {0} rounds")]
    ToolLoop(usize),
    #[error("{0}")]
    Unavailable(String),
}

/// Text fragments in production order. The stream ends on completion; an
/// `Err` item is terminal.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, RuntimeError>> + Send>>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Display identifier recorded in each completed exchange.
    fn model_id(&self) -> String;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RuntimeError>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, RuntimeError>;

    /// Answer `query` in the context of `history`, streaming the reply.
    fn stream_reply(&self, history: &[Exchange], query: &str) -> ReplyStream;
}
