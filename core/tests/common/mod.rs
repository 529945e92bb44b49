//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use hushline_core::backend::ChatBackend;
use hushline_core::server::{ChatServer, LocalBackend, Store};
use hushline_core::types::{Chat, Identity, Message};
use hushline_core::{ChatError, Config, ConversationState, Result, ServerConfig, Session};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn store(temp_dir: &TempDir) -> Arc<Store> {
    let dir = temp_dir.path().join("server");
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Store::open(&dir, &ServerConfig::default()).unwrap())
}

/// Chat server on an ephemeral port; returns its base URL
pub async fn spawn_server(temp_dir: &TempDir) -> String {
    let dir = temp_dir.path().join("server");
    std::fs::create_dir_all(&dir).unwrap();
    let store = Store::open(&dir, &ServerConfig::default()).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = ChatServer::bind(addr, store).await.unwrap();
    let url = format!("http://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());
    url
}

/// Client config with fast polling, rooted at `data_dir`
pub fn client_config(data_dir: &Path, server_url: &str) -> Config {
    Config {
        server_url: server_url.to_string(),
        data_dir: data_dir.to_path_buf(),
        chat_poll_interval: Duration::from_millis(20),
        message_poll_interval: Duration::from_millis(20),
        failure_escalation_threshold: 3,
    }
}

pub fn local_session(temp_dir: &TempDir, name: &str, backend: Arc<dyn ChatBackend>) -> Session {
    let config = client_config(&temp_dir.path().join(name), "http://unused.invalid");
    Session::new(config, backend).unwrap()
}

/// Apply updates until `pred` holds on the session state
pub async fn settle<F>(session: &mut Session, pred: F)
where
    F: Fn(&ConversationState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred(session.state()) {
            session.next_update().await;
        }
    })
    .await
    .expect("state never settled");
}

/// Backend wrapper whose reads and sends can be switched to fail
pub struct FlakyBackend {
    inner: LocalBackend,
    pub fail_reads: AtomicBool,
    pub fail_sends: AtomicBool,
    pub users_created: AtomicUsize,
    pub sends: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            inner: LocalBackend::new(store),
            fail_reads: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            users_created: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        }
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for FlakyBackend {
    async fn create_user(&self) -> Result<Identity> {
        self.users_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_user().await
    }

    async fn create_chat(&self, user_id: u64) -> Result<Chat> {
        self.inner.create_chat(user_id).await
    }

    async fn join_chat(&self, user_id: u64, chat_code: &str) -> Result<Chat> {
        self.inner.join_chat(user_id, chat_code).await
    }

    async fn list_chats(&self, user_id: u64) -> Result<Vec<Chat>> {
        Self::check(&self.fail_reads)?;
        self.inner.list_chats(user_id).await
    }

    async fn list_messages(&self, chat_id: u64, user_id: u64) -> Result<Vec<Message>> {
        Self::check(&self.fail_reads)?;
        self.inner.list_messages(chat_id, user_id).await
    }

    async fn send_message(&self, chat_id: u64, user_id: u64, content: &str) -> Result<Message> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_sends)?;
        self.inner.send_message(chat_id, user_id, content).await
    }
}
