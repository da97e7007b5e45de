use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use edge_relay_error::RelayError;

/// User/assistant pairs kept per session; older exchanges fall off.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// One completed user-query/assistant-answer pair. Immutable once appended.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub user_text: String,
    pub assistant_text: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionEntry {
    exchanges: Vec<Exchange>,
    busy: bool,
}

/// Process-wide session map: conversation history plus the per-session
/// admission guard. Every critical section is short; the lock is never held
/// across an await.
pub struct SessionStore {
    history_limit: usize,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("session lock");
        sessions.entry(session_id.to_string()).or_default();
    }

    pub fn history(&self, session_id: &str) -> Vec<Exchange> {
        let sessions = self.sessions.lock().expect("session lock");
        sessions
            .get(session_id)
            .map(|entry| entry.exchanges.clone())
            .unwrap_or_default()
    }

    pub fn append_exchange(&self, session_id: &str, exchange: Exchange) {
        let mut sessions = self.sessions.lock().expect("session lock");
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.exchanges.push(exchange);
        if entry.exchanges.len() > self.history_limit {
            let excess = entry.exchanges.len() - self.history_limit;
            entry.exchanges.drain(..excess);
        }
    }

    /// Clearing a busy session is rejected: an in-flight stream's history
    /// append must never race a truncation.
    pub fn clear(&self, session_id: &str) -> Result<(), RelayError> {
        let mut sessions = self.sessions.lock().expect("session lock");
        if let Some(entry) = sessions.get(session_id) {
            if entry.busy {
                return Err(RelayError::SessionBusy {
                    session_id: session_id.to_string(),
                });
            }
        }
        sessions.remove(session_id);
        Ok(())
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().expect("session lock");
        sessions.get(session_id).map(|entry| entry.busy).unwrap_or(false)
    }

    /// Atomically check-and-set the busy flag. The returned permit releases
    /// it on drop, covering every exit path of a submission.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str) -> Result<SessionPermit, RelayError> {
        let mut sessions = self.sessions.lock().expect("session lock");
        let entry = sessions.entry(session_id.to_string()).or_default();
        if entry.busy {
            return Err(RelayError::SessionBusy {
                session_id: session_id.to_string(),
            });
        }
        entry.busy = true;
        Ok(SessionPermit {
            store: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    fn release(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("session lock");
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.busy = false;
        }
    }
}

pub struct SessionPermit {
    store: Arc<SessionStore>,
    session_id: String,
}

impl SessionPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.store.release(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(user: &str, assistant: &str) -> Exchange {
        Exchange {
            user_text: user.to_string(),
            assistant_text: assistant.to_string(),
            model_id: "test-model".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn second_acquire_is_refused_until_the_permit_drops() {
        let store = Arc::new(SessionStore::new(DEFAULT_HISTORY_LIMIT));

        let permit = store.try_acquire("s1").expect("first acquire");
        assert!(store.is_busy("s1"));
        assert!(matches!(
            store.try_acquire("s1"),
            Err(RelayError::SessionBusy { .. })
        ));

        // Other sessions are unaffected.
        let other = store.try_acquire("s2").expect("independent session");
        drop(other);

        drop(permit);
        assert!(!store.is_busy("s1"));
        store.try_acquire("s1").expect("acquire after release");
    }

    #[test]
    fn history_is_append_only_and_ordered() {
        let store = Arc::new(SessionStore::new(DEFAULT_HISTORY_LIMIT));
        store.append_exchange("s1", exchange("q1", "a1"));
        store.append_exchange("s1", exchange("q2", "a2"));

        let history = store.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_text, "q1");
        assert_eq!(history[1].user_text, "q2");
    }

    #[test]
    fn history_trims_oldest_exchanges() {
        let store = Arc::new(SessionStore::new(2));
        for i in 0..4 {
            store.append_exchange("s1", exchange(&format!("q{i}"), "a"));
        }

        let history = store.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_text, "q2");
        assert_eq!(history[1].user_text, "q3");
    }

    #[test]
    fn clear_is_rejected_while_busy() {
        let store = Arc::new(SessionStore::new(DEFAULT_HISTORY_LIMIT));
        store.append_exchange("s1", exchange("q", "a"));

        let permit = store.try_acquire("s1").expect("acquire");
        assert!(matches!(
            store.clear("s1"),
            Err(RelayError::SessionBusy { .. })
        ));
        assert_eq!(store.history("s1").len(), 1);

        drop(permit);
        store.clear("s1").expect("clear idle session");
        assert!(store.history("s1").is_empty());
    }

    #[test]
    fn clear_of_unknown_session_is_idempotent() {
        let store = Arc::new(SessionStore::new(DEFAULT_HISTORY_LIMIT));
        store.clear("missing").expect("no-op clear");
    }
}
