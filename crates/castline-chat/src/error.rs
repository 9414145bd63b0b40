use std::time::Duration;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Everything that can go wrong inside the chat engine. None of it is fatal:
/// fetch failures leave the last good sequence on screen, send failures drop
/// the optimistic entry and are reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A message carries no usable sender field. Resolved to "not mine" and
    /// only ever logged.
    #[error("message {message_id} has no usable sender identity")]
    IdentityAmbiguous { message_id: String },

    #[error("send rejected by server: {0}")]
    SendRejected(String),

    #[error("message text is empty")]
    EmptyMessage,

    #[error("no conversation is open")]
    NoActiveConversation,

    #[error("chat session has been stopped")]
    SessionClosed,

    #[error("session store: {0}")]
    Store(String),
}

impl ChatError {
    /// Network-level failures, including timeouts.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}
