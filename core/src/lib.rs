/// Hushline - anonymous two-party chat
///
/// Client library (identity, pairing, polling sync, conversation state) plus the
/// small chat server it talks to.

pub mod error;
pub mod config;
pub mod types;
pub mod backend;
pub mod identity;
pub mod pairing;
pub mod sync;
pub mod state;
pub mod session;
pub mod server;
pub mod cli_app;

pub use backend::{ChatBackend, HttpBackend};
pub use config::{Config, ServerConfig};
pub use error::{ChatError, Result};
pub use session::Session;
pub use state::{ConversationState, Notice, NoticeLevel, SyncHealth};
pub use types::{Chat, ChatState, Identity, Message, Sender};
