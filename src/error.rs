use std::time::Duration;

use thiserror::Error;

/// Failures raised by the chat client.
///
/// Transport-level trouble is absorbed by the connection manager, which
/// reconnects on its own. The remaining variants are attached to the message
/// that triggered them and shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// A send was attempted while the channel was not open.
    #[error("Not connected to the chat server")]
    NotConnected,

    /// The channel did not open within the allotted time.
    #[error("Connection timeout after {}ms", .0.as_millis())]
    ConnectionTimeout(Duration),

    /// An inbound frame could not be decoded.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The backend reported an error explicitly.
    #[error("{0}")]
    BackendError(String),

    /// Socket or HTTP failure below the application protocol.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Whether this failure should reach the user as a notification.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ChatError::NotConnected | ChatError::ConnectionTimeout(_) | ChatError::BackendError(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
