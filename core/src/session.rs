/// The client actor: owns the conversation state and drives identity resolution,
/// pairing, sending and the polling loops. Every mutation goes through `&mut self`;
/// polling tasks only hand results back through the sync channel.
use crate::backend::{ChatBackend, HttpBackend};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::identity::IdentityStore;
use crate::pairing::PairingService;
use crate::state::{ConversationState, Notice};
use crate::sync::{LoopKind, SyncEngine, SyncEvent, Tick};
use crate::types::{Chat, Identity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

pub struct Session {
    config: Config,
    backend: Arc<dyn ChatBackend>,
    identity_store: IdentityStore,
    pairing: PairingService,
    sync: SyncEngine,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    state: ConversationState,
}

impl Session {
    pub fn new(config: Config, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        let identity_store = IdentityStore::open(&config.data_dir)?;
        let pairing = PairingService::new(backend.clone());
        let (sync, events) = SyncEngine::new(
            backend.clone(),
            config.chat_poll_interval,
            config.message_poll_interval,
        );

        Ok(Self {
            config,
            backend,
            identity_store,
            pairing,
            sync,
            events,
            state: ConversationState::new(),
        })
    }

    /// Session talking HTTP to `config.server_url`
    pub fn connect(config: Config) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(config.server_url.clone()));
        Self::new(config, backend)
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Notices queued since the last call
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.state.take_notices()
    }

    /// Resolve the identity and start the chat-list loop. Nothing else works until
    /// this succeeds.
    pub async fn start(&mut self) -> Result<Identity> {
        let identity = match self
            .identity_store
            .resolve_identity(self.backend.as_ref())
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                self.state
                    .push_notice(Notice::error(format!("Could not create identity: {}", e)));
                return Err(e);
            }
        };

        info!("Session started as {} ({})", identity.display_name, identity.id);
        self.state.set_identity(Some(identity.clone()));
        self.sync.start_chat_loop(identity.id);
        // A chat picked before the identity resolved gets its loop now
        if let Some(chat_id) = self.state.selected_chat_id() {
            self.sync.start_message_loop(chat_id, identity.id);
        }
        Ok(identity)
    }

    /// Drop the in-memory identity and stop both loops. The persisted identity stays
    /// on disk; a later `start` picks it up again.
    pub fn sign_out(&mut self) {
        self.sync.stop_all();
        self.state.set_identity(None);
        // Anything already queued belongs to the old identity
        while self.events.try_recv().is_ok() {}
        debug!("Session signed out");
    }

    /// Select a chat (or none). A different chat restarts the message loop; results
    /// still in flight for the previous one are dropped on arrival.
    pub fn select_chat(&mut self, chat_id: Option<u64>) {
        if !self.state.select_chat(chat_id) {
            return;
        }
        match (chat_id, self.state.identity().map(|i| i.id)) {
            (Some(chat_id), Some(user_id)) => self.sync.start_message_loop(chat_id, user_id),
            _ => self.sync.stop_message_loop(),
        }
    }

    pub fn set_search_query(&mut self, query: impl Into<String>) {
        self.state.set_search_query(query);
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.state.set_draft(text);
    }

    pub async fn create_chat(&mut self) -> Result<Chat> {
        let identity = self.require_identity()?;
        match self.pairing.create_chat(&identity).await {
            Ok(chat) => {
                self.sync.refresh_now();
                Ok(chat)
            }
            Err(e) => {
                self.state
                    .push_notice(Notice::error(format!("Could not create chat: {}", e)));
                Err(e)
            }
        }
    }

    /// Join by invite code and select the joined chat
    pub async fn join_chat(&mut self, chat_code: &str) -> Result<Chat> {
        let identity = self.require_identity()?;
        match self.pairing.join_chat(&identity, chat_code).await {
            Ok(chat) => {
                self.select_chat(Some(chat.id));
                self.sync.refresh_now();
                Ok(chat)
            }
            Err(e) => {
                let text = match &e {
                    ChatError::ChatNotFound(_) => "No chat matches that code".to_string(),
                    ChatError::ChatFull(_) => "That chat already has two participants".to_string(),
                    other => format!("Could not join chat: {}", other),
                };
                self.state.push_notice(Notice::error(text));
                Err(e)
            }
        }
    }

    /// Send the current draft to the selected chat. With an empty draft or no chat
    /// selected this does nothing. On failure the draft is kept for a manual retry.
    pub async fn send_message(&mut self) -> Result<()> {
        let Some(chat_id) = self.state.selected_chat_id() else {
            return Ok(());
        };
        let content = self.state.draft().trim().to_string();
        if content.is_empty() {
            return Ok(());
        }
        let identity = self.require_identity()?;

        match self
            .backend
            .send_message(chat_id, identity.id, &content)
            .await
        {
            Ok(message) => {
                debug!("Sent message {} to chat {}", message.id, chat_id);
                self.state.clear_draft();
                self.sync.refresh_now();
                Ok(())
            }
            Err(e) => {
                warn!("Send to chat {} failed: {}", chat_id, e);
                self.state
                    .push_notice(Notice::error("Message not sent, try again"));
                Err(ChatError::SendFailed(e.to_string()))
            }
        }
    }

    /// Put `content` in the draft and send it
    pub async fn send(&mut self, content: &str) -> Result<()> {
        self.state.set_draft(content);
        self.send_message().await
    }

    /// Wait for the next polling result and apply it. Returns the loop it came from,
    /// or `None` when it was stale and dropped. Pends forever while no loop is running.
    pub async fn next_update(&mut self) -> Option<LoopKind> {
        let event = self.events.recv().await?;
        self.apply(event)
    }

    /// Apply results until one from `kind` has landed (successful or not)
    pub async fn wait_for(&mut self, kind: LoopKind) {
        while self.next_update().await != Some(kind) {}
    }

    /// Apply results as they arrive until `duration` has elapsed
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while let Ok(Some(event)) = timeout_at(deadline, self.events.recv()).await {
            self.apply(event);
        }
    }

    /// Apply whatever results are already queued, without waiting. Returns how many
    /// were current.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            if self.apply(event).is_some() {
                applied += 1;
            }
        }
        applied
    }

    fn apply(&mut self, event: SyncEvent) -> Option<LoopKind> {
        let tick = self.sync.admit(event)?;

        let kind = tick.kind();
        match tick {
            Tick::Chats { result, .. } => match result {
                Ok(chats) => {
                    self.state.replace_chats(chats);
                    self.tick_ok(kind);
                }
                Err(e) => self.tick_failed(kind, e),
            },
            Tick::Messages {
                chat_id, result, ..
            } => match result {
                Ok(messages) => {
                    if self.state.selected_chat_id() == Some(chat_id) {
                        self.state.replace_messages(messages);
                    }
                    self.tick_ok(kind);
                }
                Err(e) => self.tick_failed(kind, e),
            },
        }
        Some(kind)
    }

    fn tick_ok(&mut self, kind: LoopKind) {
        if self.state.record_tick_ok(kind) {
            info!("{:?} sync recovered", kind);
            self.state.push_notice(Notice::info("Connection restored"));
        }
    }

    /// Last-known-good data stays displayed; only a run of failures reaches the user.
    fn tick_failed(&mut self, kind: LoopKind, err: ChatError) {
        let err = ChatError::SyncTickFailed(err.to_string());
        debug!("{:?} {}", kind, err);
        if self
            .state
            .record_tick_failure(kind, self.config.failure_escalation_threshold)
        {
            warn!("{:?} sync keeps failing: {}", kind, err);
            self.state
                .push_notice(Notice::error("Connection problems, still retrying"));
        }
    }

    fn require_identity(&self) -> Result<Identity> {
        self.state
            .identity()
            .cloned()
            .ok_or_else(|| ChatError::IdentityUnavailable("no identity resolved".to_string()))
    }
}
