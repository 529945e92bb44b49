/// Polling-based synchronization.
///
/// Each loop is a spawned task bound to one target (an identity for the chat list, a
/// `(chat, identity)` pair for messages). Loops never touch client state: they post
/// tagged results on a channel and the owning session decides, via [`SyncEngine::admit`],
/// whether a result is still current. Replacing or stopping a loop aborts its task,
/// which cancels both the pending timer and any request in flight.
use crate::backend::ChatBackend;
use crate::error::Result;
use crate::types::{Chat, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    ChatList,
    Messages,
}

/// What a loop fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTarget {
    ChatList { user_id: u64 },
    Messages { chat_id: u64, user_id: u64 },
}

impl LoopTarget {
    pub fn kind(&self) -> LoopKind {
        match self {
            LoopTarget::ChatList { .. } => LoopKind::ChatList,
            LoopTarget::Messages { .. } => LoopKind::Messages,
        }
    }
}

/// Outcome of one polling tick
#[derive(Debug)]
pub enum Tick {
    Chats {
        user_id: u64,
        result: Result<Vec<Chat>>,
    },
    Messages {
        chat_id: u64,
        user_id: u64,
        result: Result<Vec<Message>>,
    },
}

impl Tick {
    pub fn kind(&self) -> LoopKind {
        match self {
            Tick::Chats { .. } => LoopKind::ChatList,
            Tick::Messages { .. } => LoopKind::Messages,
        }
    }

    fn target(&self) -> LoopTarget {
        match *self {
            Tick::Chats { user_id, .. } => LoopTarget::ChatList { user_id },
            Tick::Messages {
                chat_id, user_id, ..
            } => LoopTarget::Messages { chat_id, user_id },
        }
    }
}

/// A tick tagged with the loop instance that produced it
#[derive(Debug)]
pub struct SyncEvent {
    /// Unique per started loop; a restarted loop never reuses one
    pub generation: u64,
    /// Request order within the loop, starting at 1
    pub seq: u64,
    pub tick: Tick,
}

struct PollLoop {
    target: LoopTarget,
    generation: u64,
    last_applied: u64,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SyncEngine {
    backend: Arc<dyn ChatBackend>,
    chat_interval: Duration,
    message_interval: Duration,
    events: mpsc::UnboundedSender<SyncEvent>,
    next_generation: u64,
    chat_loop: Option<PollLoop>,
    message_loop: Option<PollLoop>,
}

impl SyncEngine {
    /// Create an engine; the receiver is where loop results arrive.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        chat_interval: Duration,
        message_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            backend,
            chat_interval,
            message_interval,
            events,
            next_generation: 0,
            chat_loop: None,
            message_loop: None,
        };
        (engine, rx)
    }

    /// Poll the chat list for `user_id`. Restarting with the same target is a no-op.
    pub fn start_chat_loop(&mut self, user_id: u64) {
        let target = LoopTarget::ChatList { user_id };
        if self.chat_loop.as_ref().map(|l| l.target) == Some(target) {
            return;
        }
        self.chat_loop = Some(self.spawn(target, self.chat_interval));
    }

    pub fn stop_chat_loop(&mut self) {
        if let Some(old) = self.chat_loop.take() {
            debug!("Stopping chat-list loop {:?}", old.target);
        }
    }

    /// Poll messages of `chat_id`, replacing any loop for a different chat.
    pub fn start_message_loop(&mut self, chat_id: u64, user_id: u64) {
        let target = LoopTarget::Messages { chat_id, user_id };
        if self.message_loop.as_ref().map(|l| l.target) == Some(target) {
            return;
        }
        // Abort the old loop before the new one can post anything
        self.stop_message_loop();
        self.message_loop = Some(self.spawn(target, self.message_interval));
    }

    pub fn stop_message_loop(&mut self) {
        if let Some(old) = self.message_loop.take() {
            debug!("Stopping message loop {:?}", old.target);
        }
    }

    pub fn stop_all(&mut self) {
        self.stop_message_loop();
        self.stop_chat_loop();
    }

    /// Wake every running loop for an immediate out-of-cycle tick.
    pub fn refresh_now(&self) {
        for l in [&self.chat_loop, &self.message_loop].into_iter().flatten() {
            l.wake.notify_one();
        }
    }

    pub fn target(&self, kind: LoopKind) -> Option<LoopTarget> {
        self.slot(kind).as_ref().map(|l| l.target)
    }

    /// Accept `event` only if it comes from the live loop of its kind, targets what
    /// that loop targets, and is newer than the last accepted result.
    pub fn admit(&mut self, event: SyncEvent) -> Option<Tick> {
        let kind = event.tick.kind();
        let target = event.tick.target();
        let live = self.slot_mut(kind).as_mut()?;

        if live.generation != event.generation || live.target != target {
            debug!(
                "Discarding {:?} result from superseded loop (gen {} vs {})",
                kind, event.generation, live.generation
            );
            return None;
        }
        if event.seq <= live.last_applied {
            debug!(
                "Discarding out-of-order {:?} result (seq {} <= {})",
                kind, event.seq, live.last_applied
            );
            return None;
        }

        live.last_applied = event.seq;
        Some(event.tick)
    }

    fn slot(&self, kind: LoopKind) -> &Option<PollLoop> {
        match kind {
            LoopKind::ChatList => &self.chat_loop,
            LoopKind::Messages => &self.message_loop,
        }
    }

    fn slot_mut(&mut self, kind: LoopKind) -> &mut Option<PollLoop> {
        match kind {
            LoopKind::ChatList => &mut self.chat_loop,
            LoopKind::Messages => &mut self.message_loop,
        }
    }

    fn spawn(&mut self, target: LoopTarget, period: Duration) -> PollLoop {
        self.next_generation += 1;
        let generation = self.next_generation;
        let wake = Arc::new(Notify::new());

        debug!("Starting {:?} (gen {}, every {:?})", target, generation, period);
        let task = tokio::spawn(run_loop(
            self.backend.clone(),
            target,
            generation,
            period,
            wake.clone(),
            self.events.clone(),
        ));

        PollLoop {
            target,
            generation,
            last_applied: 0,
            wake,
            task,
        }
    }
}

async fn run_loop(
    backend: Arc<dyn ChatBackend>,
    target: LoopTarget,
    generation: u64,
    period: Duration,
    wake: Arc<Notify>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => ticker.reset(),
        }

        seq += 1;
        let tick = match target {
            LoopTarget::ChatList { user_id } => Tick::Chats {
                user_id,
                result: backend.list_chats(user_id).await,
            },
            LoopTarget::Messages { chat_id, user_id } => Tick::Messages {
                chat_id,
                user_id,
                result: backend.list_messages(chat_id, user_id).await,
            },
        };

        if events
            .send(SyncEvent {
                generation,
                seq,
                tick,
            })
            .is_err()
        {
            // Session dropped
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::types::{ChatState, Identity};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    /// Counts fetches and answers with one chat named after the call number
    #[derive(Default)]
    struct CountingBackend {
        chat_calls: AtomicU32,
        message_calls: AtomicU32,
    }

    #[async_trait]
    impl ChatBackend for CountingBackend {
        async fn create_user(&self) -> Result<Identity> {
            Err(ChatError::Transport("unused".into()))
        }
        async fn create_chat(&self, _: u64) -> Result<Chat> {
            Err(ChatError::Transport("unused".into()))
        }
        async fn join_chat(&self, _: u64, _: &str) -> Result<Chat> {
            Err(ChatError::Transport("unused".into()))
        }
        async fn list_chats(&self, _: u64) -> Result<Vec<Chat>> {
            let n = self.chat_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(vec![Chat {
                id: 1,
                chat_code: "K7QX2".into(),
                name: format!("call {}", n),
                last_message: None,
                last_activity_at: Utc::now(),
                unread_count: 0,
                avatar_code: "A1".into(),
                online: false,
                state: ChatState::Pending,
            }])
        }
        async fn list_messages(&self, _: u64, _: u64) -> Result<Vec<Message>> {
            self.message_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn send_message(&self, _: u64, _: u64, _: &str) -> Result<Message> {
            Err(ChatError::Transport("unused".into()))
        }
    }

    fn engine(
        backend: Arc<CountingBackend>,
    ) -> (SyncEngine, mpsc::UnboundedReceiver<SyncEvent>) {
        SyncEngine::new(backend, Duration::from_secs(5), Duration::from_secs(3))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate_and_admitted() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_chat_loop(7);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);

        match engine.admit(event) {
            Some(Tick::Chats { user_id, result }) => {
                assert_eq!(user_id, 7);
                assert_eq!(result.unwrap()[0].name, "call 1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_message_loop(3, 7);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_chat_discards_old_results() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_message_loop(1, 7);
        let stale = rx.recv().await.unwrap();

        engine.start_message_loop(2, 7);
        assert!(engine.admit(stale).is_none());

        let fresh = rx.recv().await.unwrap();
        match engine.admit(fresh) {
            Some(Tick::Messages { chat_id, .. }) => assert_eq!(chat_id, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_loop_goes_quiet() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_chat_loop(7);
        let first = rx.recv().await.unwrap();
        engine.stop_chat_loop();

        assert!(engine.admit(first).is_none());
        assert!(timeout(Duration::from_secs(60), rx.recv()).await.is_err());
        assert_eq!(engine.target(LoopKind::ChatList), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_sequence_is_discarded() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_chat_loop(7);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);

        assert!(engine.admit(second).is_some());
        assert!(engine.admit(first).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_skips_the_wait() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_chat_loop(7);
        rx.recv().await.unwrap();

        engine.refresh_now();
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("refresh should not wait for the interval")
            .unwrap();
        assert_eq!(event.seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_target_keeps_running_loop() {
        let backend = Arc::new(CountingBackend::default());
        let (mut engine, mut rx) = engine(backend.clone());

        engine.start_chat_loop(7);
        let first = rx.recv().await.unwrap();
        engine.start_chat_loop(7);

        // Still the same generation, so the earlier result is accepted
        assert!(engine.admit(first).is_some());
    }
}
