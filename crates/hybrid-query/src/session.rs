//! Session bookkeeping and turn cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify};

use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::history::{Conversation, HistoryConfig};

/// Cooperative cancellation flag shared between a caller and a turn.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// `Err(Cancelled)` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub type SessionHandle = Arc<AsyncMutex<Conversation>>;

/// One [`Conversation`] per session id.
///
/// The map lock is only held to look up or insert a handle; turns lock the
/// conversation itself, so one session's turns are serialized while other
/// sessions proceed independently.
pub struct SessionRegistry {
    config: HistoryConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a session under a fresh id.
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.map().insert(
            id.clone(),
            Arc::new(AsyncMutex::new(Conversation::new(id.clone(), self.config.clone()))),
        );
        id
    }

    /// The session's handle, creating an empty conversation on first use.
    pub fn get_or_create(&self, session_id: &str) -> Result<SessionHandle> {
        if session_id.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }
        let handle = self
            .map()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Conversation::new(
                    session_id,
                    self.config.clone(),
                )))
            })
            .clone();
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.map().get(session_id).cloned()
    }

    /// Discard the session and all of its turns. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.map().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_query_core::models::QueryTurn;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_or_create_reuses_conversation() {
        let registry = SessionRegistry::new(HistoryConfig::default());
        let a = registry.get_or_create("s1").unwrap();
        a.lock().await.append(QueryTurn::user("hello"));
        let b = registry.get_or_create("s1").unwrap();
        assert_eq!(b.lock().await.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_discards_turns() {
        let registry = SessionRegistry::new(HistoryConfig::default());
        let id = registry.create();
        registry
            .get_or_create(&id)
            .unwrap()
            .lock()
            .await
            .append(QueryTurn::user("hello"));
        assert!(registry.end_session(&id));
        assert!(!registry.end_session(&id));
        assert!(registry.get_or_create(&id).unwrap().lock().await.is_empty());
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let registry = SessionRegistry::new(HistoryConfig::default());
        assert!(matches!(
            registry.get_or_create("  "),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(token.check(), Err(EngineError::Cancelled)));
    }
}
