/// Reference chat server: sled storage behind a small JSON API
pub mod api;
pub mod store;

use crate::backend::ChatBackend;
use crate::error::{ChatError, Result};
use crate::types::{Chat, Identity, Message};
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use store::Store;

pub struct ChatServer {
    listener: TcpListener,
    store: Arc<Store>,
}

impl ChatServer {
    /// Bind the listener; port 0 picks a free one (see `local_addr`)
    pub async fn bind(addr: SocketAddr, store: Store) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ChatError::Io)?;
        Ok(Self {
            listener,
            store: Arc::new(store),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(ChatError::Io)
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("Chat API started on http://{}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, _peer)) => {
                    let io = TokioIo::new(stream);
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req| {
                            let store = store.clone();
                            async move { Ok::<_, Infallible>(api::handle(req, &store).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            if !e.is_incomplete_message() {
                                error!("Chat API connection error: {:?}", e);
                            }
                        }
                    });
                }
                Err(e) => error!("Chat API accept error: {}", e),
            }
        }
    }
}

/// `ChatBackend` calling a `Store` in-process, no HTTP in between
#[derive(Clone)]
pub struct LocalBackend {
    store: Arc<Store>,
}

impl LocalBackend {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    async fn create_user(&self) -> Result<Identity> {
        self.store.create_user()
    }

    async fn create_chat(&self, user_id: u64) -> Result<Chat> {
        self.store.create_chat(user_id)
    }

    async fn join_chat(&self, user_id: u64, chat_code: &str) -> Result<Chat> {
        self.store.join_chat(user_id, chat_code)
    }

    async fn list_chats(&self, user_id: u64) -> Result<Vec<Chat>> {
        self.store.list_chats(user_id)
    }

    async fn list_messages(&self, chat_id: u64, user_id: u64) -> Result<Vec<Message>> {
        self.store.list_messages(chat_id, user_id)
    }

    async fn send_message(&self, chat_id: u64, user_id: u64, content: &str) -> Result<Message> {
        self.store.send_message(chat_id, user_id, content)
    }
}
