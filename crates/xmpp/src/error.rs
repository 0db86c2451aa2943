use collab_core::error::EventBusError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("a session is already running on this transport")]
    AlreadyConnected,

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("stream closed by server")]
    StreamClosed,

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("unexpected server reply: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl ConnectionError {
    /// Whether the failure belongs to the SASL exchange rather than the
    /// transport.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("connection was already opened")]
    AlreadyOpened,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}
