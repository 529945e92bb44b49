/// Client-side read model observed by the presentation layer
use crate::sync::LoopKind;
use crate::types::{Chat, Identity, Message};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHealth {
    Healthy,
    /// Several ticks in a row failed; last-known-good data is still shown
    Degraded { consecutive_failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// One transient notification for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Default)]
struct LoopStatus {
    consecutive_failures: u32,
    degraded: bool,
}

#[derive(Debug, Default)]
pub struct ConversationState {
    identity: Option<Identity>,
    chats: Vec<Chat>,
    selected_chat: Option<u64>,
    messages: Vec<Message>,
    search_query: String,
    draft: String,
    chat_list_status: LoopStatus,
    message_status: LoopStatus,
    notices: VecDeque<Notice>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Set the resolved identity. Clearing it drops everything derived from it.
    pub fn set_identity(&mut self, identity: Option<Identity>) {
        if identity.is_none() {
            self.chats.clear();
            self.selected_chat = None;
            self.messages.clear();
            self.draft.clear();
            self.chat_list_status = LoopStatus::default();
            self.message_status = LoopStatus::default();
        }
        self.identity = identity;
    }

    /// Chats as last fetched, unfiltered
    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    /// Chats matching the search query (name or last message, case-insensitive),
    /// most recent activity first
    pub fn filtered_chats(&self) -> Vec<&Chat> {
        let query = self.search_query.trim().to_lowercase();
        let mut out: Vec<&Chat> = self
            .chats
            .iter()
            .filter(|c| {
                query.is_empty()
                    || c.name.to_lowercase().contains(&query)
                    || c
                        .last_message
                        .as_deref()
                        .map(|m| m.to_lowercase().contains(&query))
                        .unwrap_or(false)
            })
            .collect();
        out.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then(b.id.cmp(&a.id))
        });
        out
    }

    pub fn total_unread(&self) -> u32 {
        self.chats.iter().map(|c| c.unread_count).sum()
    }

    /// Wholesale replacement with a fetched list
    pub fn replace_chats(&mut self, chats: Vec<Chat>) {
        self.chats = chats;
    }

    pub fn selected_chat_id(&self) -> Option<u64> {
        self.selected_chat
    }

    pub fn selected_chat(&self) -> Option<&Chat> {
        let id = self.selected_chat?;
        self.chats.iter().find(|c| c.id == id)
    }

    /// Change the selected chat. Returns whether the selection actually changed; the
    /// thread of a previous chat is never shown under a new one.
    pub fn select_chat(&mut self, chat_id: Option<u64>) -> bool {
        if self.selected_chat == chat_id {
            return false;
        }
        self.selected_chat = chat_id;
        self.messages.clear();
        self.message_status = LoopStatus::default();
        true
    }

    /// Messages of the selected chat, oldest first
    pub fn active_thread(&self) -> &[Message] {
        &self.messages
    }

    /// Wholesale replacement with a fetched thread, ordered by `(created_at, id)`
    pub fn replace_messages(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.messages = messages;
    }

    pub fn search_query(&self) -> &str {
        &self.search_query
    }

    pub fn set_search_query(&mut self, query: impl Into<String>) {
        self.search_query = query.into();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn clear_draft(&mut self) {
        self.draft.clear();
    }

    pub fn health(&self, kind: LoopKind) -> SyncHealth {
        let status = self.status(kind);
        if status.degraded {
            SyncHealth::Degraded {
                consecutive_failures: status.consecutive_failures,
            }
        } else {
            SyncHealth::Healthy
        }
    }

    /// Failed ticks of `kind` since its last success
    pub fn consecutive_failures(&self, kind: LoopKind) -> u32 {
        self.status(kind).consecutive_failures
    }

    /// Record a successful tick. Returns true if the loop was degraded before.
    pub fn record_tick_ok(&mut self, kind: LoopKind) -> bool {
        let status = self.status_mut(kind);
        let recovered = status.degraded;
        *status = LoopStatus::default();
        recovered
    }

    /// Record a failed tick. Returns true only on the tick that crosses `threshold`,
    /// so escalation happens once per outage.
    pub fn record_tick_failure(&mut self, kind: LoopKind, threshold: u32) -> bool {
        let status = self.status_mut(kind);
        status.consecutive_failures += 1;
        if !status.degraded && status.consecutive_failures >= threshold.max(1) {
            status.degraded = true;
            return true;
        }
        false
    }

    pub fn push_notice(&mut self, notice: Notice) {
        self.notices.push_back(notice);
    }

    /// Hand pending notices to the presentation layer
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    fn status(&self, kind: LoopKind) -> &LoopStatus {
        match kind {
            LoopKind::ChatList => &self.chat_list_status,
            LoopKind::Messages => &self.message_status,
        }
    }

    fn status_mut(&mut self, kind: LoopKind) -> &mut LoopStatus {
        match kind {
            LoopKind::ChatList => &mut self.chat_list_status,
            LoopKind::Messages => &mut self.message_status,
        }
    }
}
