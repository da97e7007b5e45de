use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use edge_relay_error::RelayError;

use crate::runtime::AgentRuntime;
use crate::session::{Exchange, SessionStore};

const FRAGMENT_BUFFER: usize = 32;

/// Orchestrates one query: admission control, runtime drain, and history
/// append, with each output fragment forwarded to the caller as soon as the
/// runtime produces it.
pub struct StreamingRelay {
    store: Arc<SessionStore>,
    runtime: Arc<dyn AgentRuntime>,
}

impl StreamingRelay {
    pub fn new(store: Arc<SessionStore>, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { store, runtime }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Admission-check the session and start draining the runtime. The
    /// returned stream yields fragments in production order and ends on
    /// completion or after a terminal error fragment.
    pub fn submit(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<ReceiverStream<String>, RelayError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "query cannot be empty".to_string(),
            });
        }

        let permit = self.store.try_acquire(session_id)?;
        let history = self.store.history(session_id);
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);

        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            // The permit is released when this task ends, whichever way.
            let _permit = permit;
            let mut reply = runtime.stream_reply(&history, &query);
            let mut assistant_text = String::new();

            loop {
                tokio::select! {
                    // Caller gone: stop waiting on the runtime, discard the turn.
                    _ = tx.closed() => {
                        tracing::debug!(session_id = %session_id, "caller disconnected mid-stream");
                        return;
                    }
                    chunk = reply.next() => match chunk {
                        Some(Ok(fragment)) => {
                            if fragment.is_empty() {
                                continue;
                            }
                            assistant_text.push_str(&fragment);
                            if tx.send(fragment).await.is_err() {
                                tracing::debug!(session_id = %session_id, "caller disconnected mid-stream");
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::error!(session_id = %session_id, error = %err, "agent runtime failed mid-stream");
                            let _ = tx.send(format!("\n[error: {err}]")).await;
                            return;
                        }
                        None => break,
                    },
                }
            }

            // Record the exchange before the caller sees end-of-stream.
            store.append_exchange(
                &session_id,
                Exchange {
                    user_text: query,
                    assistant_text,
                    model_id: runtime.model_id(),
                    timestamp: Utc::now(),
                },
            );
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, MockTurn};
    use crate::session::DEFAULT_HISTORY_LIMIT;
    use std::time::Duration;

    fn relay_with(turns: Vec<MockTurn>) -> StreamingRelay {
        let store = Arc::new(SessionStore::new(DEFAULT_HISTORY_LIMIT));
        let runtime = Arc::new(MockRuntime::new().script(turns));
        StreamingRelay::new(store, runtime)
    }

    async fn drain(stream: ReceiverStream<String>) -> String {
        stream.collect::<Vec<_>>().await.concat()
    }

    #[tokio::test]
    async fn fragments_concatenate_to_the_stored_exchange() {
        let relay = relay_with(vec![MockTurn::reply(&["Hello", ", ", "world"])]);

        let body = drain(relay.submit("s1", "hi").expect("accepted")).await;
        assert_eq!(body, "Hello, world");

        let history = relay.store().history("s1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_text, "hi");
        assert_eq!(history[0].assistant_text, body);
        assert!(!relay.store().is_busy("s1"));
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_acquiring_the_session() {
        let relay = relay_with(vec![]);
        let err = relay.submit("s1", "   ").unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest { .. }));
        assert!(!relay.store().is_busy("s1"));
    }

    #[tokio::test]
    async fn runtime_failure_emits_terminal_fragment_and_discards_the_exchange() {
        let relay = relay_with(vec![MockTurn::failing(&["partial "], "boom")]);

        let body = drain(relay.submit("s1", "hi").expect("accepted")).await;
        assert!(body.starts_with("partial "));
        assert!(body.contains("[error:"));

        assert!(relay.store().history("s1").is_empty());
        assert!(!relay.store().is_busy("s1"));
    }

    #[tokio::test]
    async fn dropped_caller_releases_the_session_without_appending() {
        let hold = Arc::new(tokio::sync::Notify::new());
        let relay = relay_with(vec![MockTurn::held(&["first"], hold.clone())]);

        let mut stream = relay.submit("s1", "hi").expect("accepted");
        let first = stream.next().await.expect("first fragment");
        assert_eq!(first, "first");
        assert!(relay.store().is_busy("s1"));

        // Caller walks away mid-stream.
        drop(stream);

        let mut released = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !relay.store().is_busy("s1") {
                released = true;
                break;
            }
        }
        assert!(released, "busy flag must clear within the grace period");
        assert!(relay.store().history("s1").is_empty());
    }
}
