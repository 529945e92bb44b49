/// Chat creation and invite-code redemption
use crate::backend::ChatBackend;
use crate::error::{ChatError, Result};
use crate::types::{Chat, Identity};
use std::sync::Arc;
use tracing::{debug, info};

/// Normalise a user-typed invite code: surrounding whitespace dropped, upper-cased.
pub fn normalize_chat_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Clone)]
pub struct PairingService {
    backend: Arc<dyn ChatBackend>,
}

impl PairingService {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Allocate a new pending chat owned by `identity`; the returned code is meant to
    /// be shared out of band.
    pub async fn create_chat(&self, identity: &Identity) -> Result<Chat> {
        let chat = self.backend.create_chat(identity.id).await?;
        info!("Created chat {} with code {}", chat.id, chat.chat_code);
        Ok(chat)
    }

    /// Redeem `chat_code` as `identity`. Fails with `ChatNotFound` for an unknown (or
    /// empty) code and `ChatFull` when two other identities already hold the chat.
    pub async fn join_chat(&self, identity: &Identity, chat_code: &str) -> Result<Chat> {
        let code = normalize_chat_code(chat_code);
        if code.is_empty() {
            return Err(ChatError::ChatNotFound("empty chat code".to_string()));
        }

        debug!("Identity {} joining chat {}", identity.id, code);
        let chat = self.backend.join_chat(identity.id, &code).await?;
        info!("Joined chat {} ({:?})", chat.id, chat.state);
        Ok(chat)
    }
}
