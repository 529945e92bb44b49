/// Shared types for the chat client and server
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anonymous principal issued by the server and persisted by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: u64,
    /// Four random digits, also shown in the display name
    pub anonymous_id: String,
    pub display_name: String,
    /// "A1" ... "A9"
    pub avatar_code: String,
}

/// Participant-count lifecycle of a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    /// One participant, code not yet redeemed
    Pending,
    /// Two participants
    Active,
}

impl ChatState {
    pub fn from_participants(count: usize) -> Self {
        if count >= 2 {
            ChatState::Active
        } else {
            ChatState::Pending
        }
    }
}

/// One chat as seen by a given identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: u64,
    pub chat_code: String,
    /// Display name of the other participant ("New chat" while pending)
    pub name: String,
    pub last_message: Option<String>,
    /// Time of the newest message, or the chat's creation time
    pub last_activity_at: DateTime<Utc>,
    pub unread_count: u32,
    pub avatar_code: String,
    /// Whether the other participant was seen recently
    pub online: bool,
    pub state: ChatState,
}

/// Who wrote a message, relative to the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Me,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub avatar_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub chat_id: u64,
    pub sender_id: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Metadata only: no cryptographic transformation is applied to `content`
    pub encrypted: bool,
    pub sender: Sender,
    pub author: Author,
}

// ─── Wire requests ───────────────────────────────────────────────────────────

/// Body of `POST /chats`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatsRequest {
    CreateUser,
    CreateChat { user_id: u64 },
    JoinChat { user_id: u64, chat_code: String },
}

/// Body of `POST /messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: u64,
    pub user_id: u64,
    pub content: String,
}

/// Answer to a successful `join_chat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub chat: Chat,
}

/// Human-friendly age of a timestamp, used by list views
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - at).num_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{} min ago", minutes)
    } else if minutes < 1440 {
        format!("{} h ago", minutes / 60)
    } else {
        at.format("%-d %b").to_string()
    }
}
