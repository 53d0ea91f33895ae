//! `SessionRegistry`: maps a user id to its single live connection and
//! sends to it, tolerating the user being offline.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::model::UserId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("send failed: connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// A live bidirectional session, addressed by user id. The registry
/// only knows how to hand text frames to it; the transport (an HTTP
/// upgrade handler) owns attach/detach around connect/disconnect.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, UnboundedSender<String>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces any existing session for `user_id`.
    pub async fn attach(&self, user_id: UserId, sender: UnboundedSender<String>) {
        self.sessions.lock().await.insert(user_id, sender);
    }

    pub async fn detach(&self, user_id: UserId) {
        self.sessions.lock().await.remove(&user_id);
    }

    /// No-op success when the user has no live session.
    pub async fn send(&self, user_id: UserId, text: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&user_id) {
            Some(sender) => sender.send(text.to_string()).map_err(|_| SessionError::Closed),
            None => Ok(()),
        }
    }

    pub async fn is_attached(&self, user_id: UserId) -> bool {
        self.sessions.lock().await.contains_key(&user_id)
    }

    /// Closes every live session. Flushes no state: sessions are
    /// reconstructed by clients reconnecting after restart.
    pub async fn shutdown(&self) {
        self.sessions.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_user_is_a_noop() {
        let registry = SessionRegistry::new();
        registry.send(17, "update").await.unwrap();
    }

    #[tokio::test]
    async fn attach_then_send_delivers() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.attach(1, tx).await;
        registry.send(1, "update").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "update");
    }

    #[tokio::test]
    async fn reattach_replaces_prior_session() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        registry.attach(1, tx1).await;
        registry.attach(1, tx2).await;
        registry.send(1, "update").await.unwrap();
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.recv().await.unwrap(), "update");
    }

    #[tokio::test]
    async fn detach_makes_subsequent_sends_noop() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.attach(1, tx).await;
        registry.detach(1).await;
        assert!(!registry.is_attached(1).await);
        registry.send(1, "update").await.unwrap();
    }
}
