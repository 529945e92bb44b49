/// Chat server storage in sled.
///
/// Trees (all ids big-endian `u64`):
///   users        user_id            -> UserRecord
///   presence     user_id            -> last seen (RFC3339)
///   chats        chat_id            -> ChatRecord
///   chat_codes   code               -> chat_id
///   memberships  user_id ++ chat_id -> ()
///   messages     chat_id ++ msg_id  -> MessageRecord
///   chat_heads   chat_id            -> `created_at` of the newest message
///   last_read    user_id ++ chat_id -> newest read `created_at`
use crate::config::ServerConfig;
use crate::error::{ChatError, Result};
use crate::pairing::normalize_chat_code;
use crate::types::{Author, Chat, ChatState, Identity, Message, Sender};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Unambiguous upper-case alphabet (no 0/O, 1/I)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const MAX_PARTICIPANTS: usize = 2;
const MAX_CONTENT_CHARS: usize = 4000;
const NEW_CHAT_NAME: &str = "New chat";
const DEFAULT_AVATAR: &str = "A1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    identity: Identity,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatRecord {
    id: u64,
    chat_code: String,
    created_at: DateTime<Utc>,
    /// Creator first
    participants: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    id: u64,
    chat_id: u64,
    sender_id: u64,
    content: String,
    created_at: DateTime<Utc>,
    encrypted: bool,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_be_bytes());
    key[8..].copy_from_slice(&b.to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChatError::Storage(format!("Malformed id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Random chat code of `len` characters
pub fn generate_chat_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    users: sled::Tree,
    presence: sled::Tree,
    chats: sled::Tree,
    codes: sled::Tree,
    memberships: sled::Tree,
    messages: sled::Tree,
    chat_heads: sled::Tree,
    last_read: sled::Tree,
    online_window: chrono::Duration,
    code_len: usize,
    max_code_attempts: u32,
}

impl Store {
    /// Open (or create) the database under `data_dir`
    pub fn open(data_dir: &Path, config: &ServerConfig) -> Result<Self> {
        let db_path = data_dir.join("chat.db");
        let db = sled::open(&db_path)
            .map_err(|e| ChatError::Storage(format!("Failed to open chat DB: {}", e)))?;
        info!("Chat store opened at {:?}", db_path);
        Self::with_db(db, config)
    }

    fn with_db(db: sled::Db, config: &ServerConfig) -> Result<Self> {
        let online_window = chrono::Duration::from_std(config.online_window)
            .map_err(|e| ChatError::Config(format!("online window out of range: {}", e)))?;
        if config.chat_code_len == 0 {
            return Err(ChatError::Config("chat code length must be positive".into()));
        }

        Ok(Self {
            users: db.open_tree("users")?,
            presence: db.open_tree("presence")?,
            chats: db.open_tree("chats")?,
            codes: db.open_tree("chat_codes")?,
            memberships: db.open_tree("memberships")?,
            messages: db.open_tree("messages")?,
            chat_heads: db.open_tree("chat_heads")?,
            last_read: db.open_tree("last_read")?,
            db,
            online_window,
            code_len: config.chat_code_len,
            max_code_attempts: config.max_code_attempts,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Users ───────────────────────────────────────────────────────────────

    /// Issue a new anonymous identity
    pub fn create_user(&self) -> Result<Identity> {
        let id = self.next_id()?;
        let (anonymous_id, avatar_code) = {
            let mut rng = rand::thread_rng();
            (
                format!("{:04}", rng.gen_range(0..10_000)),
                format!("A{}", rng.gen_range(1..=9)),
            )
        };
        let identity = Identity {
            id,
            display_name: format!("Anonymous #{}", anonymous_id),
            anonymous_id,
            avatar_code,
        };

        let record = UserRecord {
            identity: identity.clone(),
            created_at: Utc::now(),
        };
        self.users.insert(id_key(id), serde_json::to_vec(&record)?)?;
        self.touch(id)?;

        info!("Created user {} ({})", id, identity.display_name);
        Ok(identity)
    }

    pub fn get_user(&self, user_id: u64) -> Result<Option<Identity>> {
        match self.users.get(id_key(user_id))? {
            Some(raw) => {
                let record: UserRecord = serde_json::from_slice(&raw)?;
                Ok(Some(record.identity))
            }
            None => Ok(None),
        }
    }

    /// Record that `user_id` was just active
    pub fn touch(&self, user_id: u64) -> Result<()> {
        self.presence
            .insert(id_key(user_id), serde_json::to_vec(&Utc::now())?)?;
        Ok(())
    }

    pub fn last_seen(&self, user_id: u64) -> Result<Option<DateTime<Utc>>> {
        match self.presence.get(id_key(user_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_online(&self, user_id: u64, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .last_seen(user_id)?
            .map(|seen| now - seen <= self.online_window)
            .unwrap_or(false))
    }

    // ─── Chats ───────────────────────────────────────────────────────────────

    /// New pending chat owned by `user_id`, with a freshly reserved code
    pub fn create_chat(&self, user_id: u64) -> Result<Chat> {
        self.require_user(user_id)?;
        self.touch(user_id)?;

        let chat_id = self.next_id()?;
        let chat_code = self.reserve_code(chat_id)?;
        let record = ChatRecord {
            id: chat_id,
            chat_code,
            created_at: Utc::now(),
            participants: vec![user_id],
        };
        self.chats
            .insert(id_key(chat_id), serde_json::to_vec(&record)?)?;
        self.memberships
            .insert(pair_key(user_id, chat_id), &[] as &[u8])?;

        info!("User {} created chat {} ({})", user_id, chat_id, record.chat_code);
        self.chat_view(&record, user_id, Utc::now())
    }

    /// Add `user_id` as the second participant of the chat behind `chat_code`.
    /// Re-joining a chat one already belongs to succeeds without changes.
    pub fn join_chat(&self, user_id: u64, chat_code: &str) -> Result<Chat> {
        self.require_user(user_id)?;
        self.touch(user_id)?;

        let code = normalize_chat_code(chat_code);
        let chat_id = match self.codes.get(code.as_bytes())? {
            Some(raw) => decode_id(&raw)?,
            None => return Err(ChatError::ChatNotFound(code)),
        };

        let record = loop {
            let current = self
                .chats
                .get(id_key(chat_id))?
                .ok_or_else(|| ChatError::ChatNotFound(code.clone()))?;
            let mut record: ChatRecord = serde_json::from_slice(&current)?;

            if record.participants.contains(&user_id) {
                self.memberships
                    .insert(pair_key(user_id, chat_id), &[] as &[u8])?;
                break record;
            }
            if record.participants.len() >= MAX_PARTICIPANTS {
                return Err(ChatError::ChatFull(code));
            }

            record.participants.push(user_id);
            let updated = serde_json::to_vec(&record)?;
            match self
                .chats
                .compare_and_swap(id_key(chat_id), Some(&current), Some(updated))?
            {
                Ok(()) => {
                    self.memberships
                        .insert(pair_key(user_id, chat_id), &[] as &[u8])?;
                    info!("User {} joined chat {}", user_id, chat_id);
                    break record;
                }
                // Someone else joined in between; look again
                Err(_) => debug!("Join race on chat {}, retrying", chat_id),
            }
        };

        self.chat_view(&record, user_id, Utc::now())
    }

    /// Every chat `user_id` participates in, most recent activity first
    pub fn list_chats(&self, user_id: u64) -> Result<Vec<Chat>> {
        self.require_user(user_id)?;
        self.touch(user_id)?;

        let now = Utc::now();
        let mut out = Vec::new();
        for entry in self.memberships.scan_prefix(id_key(user_id)) {
            let (key, _) = entry?;
            let chat_id = decode_id(&key[8..])?;
            if let Some(record) = self.load_chat(chat_id)? {
                out.push(self.chat_view(&record, user_id, now)?);
            }
        }

        out.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then(b.id.cmp(&a.id))
        });
        Ok(out)
    }

    /// Number of messages in `chat_id` newer than what `user_id` has read, excluding
    /// the user's own
    pub fn unread_count(&self, chat_id: u64, user_id: u64) -> Result<u32> {
        let last_read = self.last_read(user_id, chat_id)?;
        let count = self
            .chat_messages(chat_id)?
            .iter()
            .filter(|m| m.sender_id != user_id && last_read.map_or(true, |t| m.created_at > t))
            .count();
        Ok(count as u32)
    }

    /// Move the read marker forward to `upto`; never moves it back
    pub fn mark_read(&self, user_id: u64, chat_id: u64, upto: DateTime<Utc>) -> Result<()> {
        let key = pair_key(user_id, chat_id);
        let updated = serde_json::to_vec(&upto)?;
        loop {
            let current = self.last_read.get(key)?;
            if let Some(raw) = &current {
                let read_at: DateTime<Utc> = serde_json::from_slice(raw)?;
                if read_at >= upto {
                    return Ok(());
                }
            }
            match self
                .last_read
                .compare_and_swap(key, current.as_ref(), Some(updated.clone()))?
            {
                Ok(()) => return Ok(()),
                Err(_) => debug!("Read marker race for user {} in chat {}, retrying", user_id, chat_id),
            }
        }
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    /// Full thread of `chat_id` as seen by `user_id`, oldest first. Marks it read.
    pub fn list_messages(&self, chat_id: u64, user_id: u64) -> Result<Vec<Message>> {
        self.require_user(user_id)?;
        self.require_participant(chat_id, user_id)?;
        self.touch(user_id)?;

        let mut authors: HashMap<u64, Author> = HashMap::new();
        let mut out = Vec::new();
        for record in self.chat_messages(chat_id)? {
            if !authors.contains_key(&record.sender_id) {
                authors.insert(record.sender_id, self.author(record.sender_id)?);
            }
            let author = authors[&record.sender_id].clone();
            out.push(message_view(record, user_id, author));
        }

        if let Some(newest) = out.last() {
            self.mark_read(user_id, chat_id, newest.created_at)?;
        }
        Ok(out)
    }

    pub fn send_message(&self, chat_id: u64, user_id: u64, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidRequest("Content is required".into()));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ChatError::InvalidRequest(format!(
                "Content exceeds {} characters",
                MAX_CONTENT_CHARS
            )));
        }
        self.require_user(user_id)?;
        self.require_participant(chat_id, user_id)?;
        self.touch(user_id)?;

        let record = self.append_message(chat_id, user_id, content)?;
        debug!("User {} posted message {} in chat {}", user_id, record.id, chat_id);

        let author = self.author(user_id)?;
        Ok(message_view(record, user_id, author))
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn next_id(&self) -> Result<u64> {
        // generate_id starts at 0; keep 0 free
        Ok(self.db.generate_id()? + 1)
    }

    /// Assign `(id, created_at)` and store the message in one transaction with the
    /// chat head, so each new message sorts strictly after every earlier one.
    fn append_message(&self, chat_id: u64, sender_id: u64, content: &str) -> Result<MessageRecord> {
        let head_key = id_key(chat_id).to_vec();
        let outcome = (&self.chat_heads, &self.messages).transaction(|(heads, messages)| {
            let previous: Option<DateTime<Utc>> = match heads.get(&head_key)? {
                Some(raw) => Some(
                    serde_json::from_slice(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(ChatError::from(e)))?,
                ),
                None => None,
            };
            let now = Utc::now();
            let created_at = match previous {
                Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
                _ => now,
            };

            // Drawn inside the closure: a retried commit gets an id above the winner's
            let id = self
                .db
                .generate_id()
                .map_err(ConflictableTransactionError::Storage)?
                + 1;
            let record = MessageRecord {
                id,
                chat_id,
                sender_id,
                content: content.to_string(),
                created_at,
                // No cryptography is applied anywhere; the flag must not claim otherwise
                encrypted: false,
            };

            let encoded = serde_json::to_vec(&record)
                .map_err(|e| ConflictableTransactionError::Abort(ChatError::from(e)))?;
            let head = serde_json::to_vec(&created_at)
                .map_err(|e| ConflictableTransactionError::Abort(ChatError::from(e)))?;
            messages.insert(pair_key(chat_id, id).to_vec(), encoded)?;
            heads.insert(head_key.clone(), head)?;
            Ok(record)
        });

        outcome.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => ChatError::from(err),
        })
    }

    fn reserve_code(&self, chat_id: u64) -> Result<String> {
        for attempt in 1..=self.max_code_attempts {
            let code = generate_chat_code(self.code_len);
            let claimed = self.codes.compare_and_swap(
                code.as_bytes(),
                None as Option<&[u8]>,
                Some(id_key(chat_id).to_vec()),
            )?;
            match claimed {
                Ok(()) => return Ok(code),
                Err(_) => debug!("Chat code collision on attempt {}, re-rolling", attempt),
            }
        }
        Err(ChatError::Storage(format!(
            "No free chat code after {} attempts",
            self.max_code_attempts
        )))
    }

    fn require_user(&self, user_id: u64) -> Result<Identity> {
        self.get_user(user_id)?
            .ok_or_else(|| ChatError::InvalidRequest(format!("Unknown user {}", user_id)))
    }

    fn require_participant(&self, chat_id: u64, user_id: u64) -> Result<ChatRecord> {
        let record = self
            .load_chat(chat_id)?
            .ok_or_else(|| ChatError::ChatNotFound(format!("chat {}", chat_id)))?;
        if !record.participants.contains(&user_id) {
            return Err(ChatError::NotParticipant(chat_id));
        }
        Ok(record)
    }

    fn load_chat(&self, chat_id: u64) -> Result<Option<ChatRecord>> {
        match self.chats.get(id_key(chat_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn last_read(&self, user_id: u64, chat_id: u64) -> Result<Option<DateTime<Utc>>> {
        match self.last_read.get(pair_key(user_id, chat_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Messages of one chat ordered by `(created_at, id)`
    fn chat_messages(&self, chat_id: u64) -> Result<Vec<MessageRecord>> {
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(id_key(chat_id)) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice::<MessageRecord>(&value)?);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn author(&self, user_id: u64) -> Result<Author> {
        Ok(match self.get_user(user_id)? {
            Some(identity) => Author {
                name: identity.display_name,
                avatar_code: identity.avatar_code,
            },
            None => Author {
                name: format!("User {}", user_id),
                avatar_code: DEFAULT_AVATAR.to_string(),
            },
        })
    }

    /// `record` as seen by `viewer`: the other participant's name and presence,
    /// newest message, unread count
    fn chat_view(&self, record: &ChatRecord, viewer: u64, now: DateTime<Utc>) -> Result<Chat> {
        let other = record.participants.iter().copied().find(|&p| p != viewer);
        let (name, avatar_code, online) = match other {
            Some(other_id) => {
                let online = self.is_online(other_id, now)?;
                match self.get_user(other_id)? {
                    Some(user) => (user.display_name, user.avatar_code, online),
                    None => (NEW_CHAT_NAME.to_string(), DEFAULT_AVATAR.to_string(), online),
                }
            }
            None => (NEW_CHAT_NAME.to_string(), DEFAULT_AVATAR.to_string(), false),
        };

        let messages = self.chat_messages(record.id)?;
        let newest = messages.last();
        let unread_count = self.unread_count(record.id, viewer)?;

        Ok(Chat {
            id: record.id,
            chat_code: record.chat_code.clone(),
            name,
            last_message: newest.map(|m| m.content.clone()),
            last_activity_at: newest.map(|m| m.created_at).unwrap_or(record.created_at),
            unread_count,
            avatar_code,
            online,
            state: ChatState::from_participants(record.participants.len()),
        })
    }
}

fn message_view(record: MessageRecord, viewer: u64, author: Author) -> Message {
    Message {
        id: record.id,
        chat_id: record.chat_id,
        sender: if record.sender_id == viewer {
            Sender::Me
        } else {
            Sender::Other
        },
        sender_id: record.sender_id,
        content: record.content,
        created_at: record.created_at,
        encrypted: record.encrypted,
        author,
    }
}
