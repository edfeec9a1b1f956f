use std::io;

/// Everything that can go wrong on either side of a lobby connection.
///
/// Per-connection variants (`MalformedMessage`, `UnknownKey`, `ConnectionLost`,
/// `UnexpectedHandshake`, `HandlerPanicked`) end the owning connection's task and nothing else.
/// Only `Bind` and `Connect` are surfaced as failures of a whole attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message")]
    MalformedMessage(#[source] serde_json::Error),

    #[error("failed to encode message")]
    Encode(#[source] serde_json::Error),

    #[error("no handler registered for key '{0}'")]
    UnknownKey(String),

    #[error("connection lost")]
    ConnectionLost(#[source] io::Error),

    #[error("registration is closed")]
    RegistrationRejected,

    #[error("expected a registration handshake, got '{key}'")]
    UnexpectedHandshake { key: String },

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server has already been started or shut down")]
    AlreadyStarted,

    #[error("client must register before sending requests")]
    NotRegistered,

    #[error("client has already registered")]
    AlreadyRegistered,

    #[error("connection is closed")]
    NotConnected,

    #[error("message handler for '{key}' panicked")]
    HandlerPanicked { key: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
