//! Ошибки rendezvous-сессий, прямых соединений и mesh

use thiserror::Error;

/// Ошибки уровня rendezvous-сессии
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot connect to rendezvous server: {0}")]
    Connection(String),
    #[error("rejected by rendezvous server: {0}")]
    Rejected(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("remote request failed: {0}")]
    RemoteRequest(String),
    #[error("request {0} timed out")]
    Timeout(u64),
    #[error("session is closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl SessionError {
    /// Переводит строку `{error}` из handshake (`"<Kind>: <detail>"`) в ошибку.
    pub fn from_handshake(reason: &str) -> Self {
        if reason.starts_with("IdNotFound") {
            SessionError::NotFound(reason.to_string())
        } else {
            SessionError::Rejected(reason.to_string())
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Malformed(err.to_string())
    }
}

/// Ошибки одного прямого соединения или data channel
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::ConnectionFailed(err.to_string())
    }
}

/// Ошибки mesh-сети
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("bootstrap with {user} failed: {reason}")]
    Bootstrap { user: String, reason: String },
    #[error("file transfer failed: {0}")]
    Transfer(String),
    #[error("remote request failed: {0}")]
    RemoteRequest(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("mesh is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Transport(TransportError::SendFailed(err.to_string()))
    }
}
