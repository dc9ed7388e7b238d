//! Token-keyed registry of live relay sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::reconnect::SessionSettings;
use crate::session::RelaySession;
use crate::transport::AgentDialer;

/// Owns every live session, at most one per token.
pub struct RelayHub {
    sessions: Mutex<HashMap<String, Arc<RelaySession>>>,
    settings: Arc<SessionSettings>,
    dialer: Arc<dyn AgentDialer>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RelayHub {
    pub fn new(settings: SessionSettings, dialer: Arc<dyn AgentDialer>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            settings: Arc::new(settings),
            dialer,
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn dialer(&self) -> Arc<dyn AgentDialer> {
        Arc::clone(&self.dialer)
    }

    /// Return the live session for `token`, creating one if there is none.
    /// A session that has already been cleaned up is replaced.
    pub async fn get_or_create(self: &Arc<Self>, token: &str) -> Arc<RelaySession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(token)
            && !existing.is_closed()
        {
            return Arc::clone(existing);
        }

        let session = RelaySession::new(
            token.to_string(),
            Arc::downgrade(self),
            Arc::clone(&self.dialer),
            Arc::clone(&self.settings),
        );
        if sessions
            .insert(token.to_string(), Arc::clone(&session))
            .is_some()
        {
            debug!(token, "Replaced closed session");
        }
        info!(token, sessions = sessions.len(), "Session created");
        session
    }

    /// Look up the session for `token`.
    pub async fn get(&self, token: &str) -> Option<Arc<RelaySession>> {
        self.sessions.lock().await.get(token).cloned()
    }

    /// Remove whatever session is registered for `token`.
    pub async fn remove(&self, token: &str) -> Option<Arc<RelaySession>> {
        let removed = self.sessions.lock().await.remove(token);
        if removed.is_some() {
            info!(token, "Session removed");
        }
        removed
    }

    /// Remove `session` only if it is still the one registered for its
    /// token. A newer session under the same token is left alone.
    pub async fn remove_session(&self, session: &RelaySession) -> bool {
        let mut sessions = self.sessions.lock().await;
        let is_current = sessions
            .get(session.token())
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session));
        if is_current {
            sessions.remove(session.token());
            info!(token = %session.token(), sessions = sessions.len(), "Session removed");
        }
        is_current
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Clean up every session. Used on server shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        info!(count = sessions.len(), "Shutting down relay sessions");
        for session in sessions {
            session.cleanup().await;
        }
    }
}
