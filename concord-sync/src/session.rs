//! Session issuance and bootstrap fetching.
//!
//! Both live outside the socket (typically HTTP endpoints), so the room only
//! sees them through these traits.

use async_trait::async_trait;

use crate::checkpoint::{DocumentCheckpoint, PresenceCheckpoint};

/// Credentials for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// Actor id issued to this client (a guest reference).
    pub actor: String,
    pub room_id: String,
    pub doc_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session request failed: {0}")]
    Request(String),
    #[error("Session rejected: {0}")]
    Rejected(String),
    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Issues sessions. Called once per connection attempt, so the actor may
/// change between reconnects.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn fetch_session(&self) -> Result<Session, SessionError>;
}

/// Fetches the bootstrap snapshot for a session.
#[async_trait]
pub trait BootstrapSource: Send + Sync {
    async fn fetch_document(&self, session: &Session) -> Result<DocumentCheckpoint, SessionError>;

    async fn fetch_presence(&self, session: &Session) -> Result<PresenceCheckpoint, SessionError>;
}

/// Provider that always hands out the same session.
#[derive(Debug, Clone)]
pub struct StaticSession(pub Session);

#[async_trait]
impl SessionProvider for StaticSession {
    async fn fetch_session(&self) -> Result<Session, SessionError> {
        Ok(self.0.clone())
    }
}
