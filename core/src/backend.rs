/// Client side of the chat server: the two remote collaborators (`/chats`, `/messages`)
/// behind one trait so the session can be driven against fakes in tests.
use crate::error::{ChatError, Result};
use crate::types::{Chat, ChatsRequest, Identity, JoinResponse, Message, SendMessageRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `POST /chats {action: "create_user"}`
    async fn create_user(&self) -> Result<Identity>;

    /// `POST /chats {action: "create_chat", user_id}`
    async fn create_chat(&self, user_id: u64) -> Result<Chat>;

    /// `POST /chats {action: "join_chat", user_id, chat_code}`
    async fn join_chat(&self, user_id: u64, chat_code: &str) -> Result<Chat>;

    /// `GET /chats?user_id=<id>`
    async fn list_chats(&self, user_id: u64) -> Result<Vec<Chat>>;

    /// `GET /messages?chat_id=<id>&user_id=<id>`
    async fn list_messages(&self, chat_id: u64, user_id: u64) -> Result<Vec<Message>>;

    /// `POST /messages {chat_id, user_id, content}`
    async fn send_message(&self, chat_id: u64, user_id: u64, content: &str) -> Result<Message>;
}

/// `ChatBackend` over HTTP/JSON
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_chats<T: DeserializeOwned>(&self, body: &ChatsRequest) -> Result<T> {
        let url = format!("{}/chats", self.base_url);
        debug!("POST {} {:?}", url, body);
        let resp = self.client.post(&url).json(body).send().await?;
        read_json(resp).await
    }
}

/// Decode a JSON answer, turning `{ "error": ... }` bodies into typed errors
async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(text);
    Err(ChatError::from_status(status.as_u16(), message))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn create_user(&self) -> Result<Identity> {
        self.post_chats(&ChatsRequest::CreateUser).await
    }

    async fn create_chat(&self, user_id: u64) -> Result<Chat> {
        self.post_chats(&ChatsRequest::CreateChat { user_id }).await
    }

    async fn join_chat(&self, user_id: u64, chat_code: &str) -> Result<Chat> {
        let resp: JoinResponse = self
            .post_chats(&ChatsRequest::JoinChat {
                user_id,
                chat_code: chat_code.to_string(),
            })
            .await?;
        Ok(resp.chat)
    }

    async fn list_chats(&self, user_id: u64) -> Result<Vec<Chat>> {
        let url = format!("{}/chats", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        read_json(resp).await
    }

    async fn list_messages(&self, chat_id: u64, user_id: u64) -> Result<Vec<Message>> {
        let url = format!("{}/messages", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("chat_id", chat_id), ("user_id", user_id)])
            .send()
            .await?;
        read_json(resp).await
    }

    async fn send_message(&self, chat_id: u64, user_id: u64, content: &str) -> Result<Message> {
        let url = format!("{}/messages", self.base_url);
        let body = SendMessageRequest {
            chat_id,
            user_id,
            content: content.to_string(),
        };
        let resp = self.client.post(&url).json(&body).send().await?;
        read_json(resp).await
    }
}
