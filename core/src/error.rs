/// Error types for the chat client and server
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Chat is full: {0}")]
    ChatFull(String),

    #[error("Not a participant of chat {0}")]
    NotParticipant(u64),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Sync tick failed: {0}")]
    SyncTickFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    /// HTTP status the chat server answers with for this error
    pub fn status(&self) -> u16 {
        match self {
            ChatError::ChatNotFound(_) => 404,
            ChatError::ChatFull(_) => 409,
            ChatError::NotParticipant(_) => 403,
            ChatError::InvalidRequest(_) => 400,
            _ => 500,
        }
    }

    /// Rebuild an error from a non-2xx server answer
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => ChatError::ChatNotFound(message),
            409 => ChatError::ChatFull(message),
            400 => ChatError::InvalidRequest(message),
            _ => ChatError::Transport(format!("server answered {}: {}", status, message)),
        }
    }
}

impl From<sled::Error> for ChatError {
    fn from(err: sled::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_for_join_errors() {
        let err = ChatError::ChatFull("K7QX2".to_string());
        assert_eq!(err.status(), 409);
        assert!(matches!(
            ChatError::from_status(err.status(), "full".into()),
            ChatError::ChatFull(_)
        ));

        let err = ChatError::ChatNotFound("nope".to_string());
        assert!(matches!(
            ChatError::from_status(err.status(), "missing".into()),
            ChatError::ChatNotFound(_)
        ));
    }

    #[test]
    fn test_stored_record_corruption_is_server_error() {
        let err = serde_json::from_str::<u64>("not json").unwrap_err();
        assert_eq!(ChatError::from(err).status(), 500);
        assert_eq!(ChatError::InvalidRequest("empty".into()).status(), 400);
    }

    #[test]
    fn test_unknown_status_is_transport() {
        assert!(matches!(
            ChatError::from_status(502, "bad gateway".into()),
            ChatError::Transport(_)
        ));
    }
}
