use crate::backend::ChatBackend;
use crate::error::{ChatError, Result};
use crate::types::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const IDENTITY_FILE: &str = "identity.json";
const FILE_VERSION: u8 = 1;

/// What the identity file currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRecord {
    /// Written on first open; the server has not issued an identity yet
    Unprovisioned,
    Provisioned(Identity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileState {
    Unprovisioned,
    Provisioned,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFileV1 {
    version: u8,
    state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<Identity>,
}

fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITY_FILE)
}

/// Local persisted identity, one per client installation
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Open the store under `data_dir`, writing the `unprovisioned` sentinel if the
    /// file does not exist yet.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(ChatError::Io)?;
        let store = Self {
            path: identity_path(data_dir),
        };
        if !store.path.exists() {
            store.write(&IdentityRecord::Unprovisioned)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<IdentityRecord> {
        let raw = fs::read_to_string(&self.path).map_err(ChatError::Io)?;
        let parsed: IdentityFileV1 =
            serde_json::from_str(&raw).map_err(ChatError::Serialization)?;
        if parsed.version != FILE_VERSION {
            return Err(ChatError::Config(format!(
                "Unsupported identity file version: {}",
                parsed.version
            )));
        }
        match (parsed.state, parsed.identity) {
            (FileState::Unprovisioned, _) => Ok(IdentityRecord::Unprovisioned),
            (FileState::Provisioned, Some(identity)) => Ok(IdentityRecord::Provisioned(identity)),
            (FileState::Provisioned, None) => Err(ChatError::Config(
                "Identity file is marked provisioned but holds no identity".to_string(),
            )),
        }
    }

    /// Return the stored identity, asking the server for one only when none is stored.
    /// A failed creation request leaves the sentinel in place and is not retried.
    pub async fn resolve_identity(&self, backend: &dyn ChatBackend) -> Result<Identity> {
        if let IdentityRecord::Provisioned(identity) = self.load()? {
            return Ok(identity);
        }

        let identity = backend.create_user().await.map_err(|e| {
            warn!("Identity creation failed: {}", e);
            ChatError::IdentityUnavailable(e.to_string())
        })?;

        self.write(&IdentityRecord::Provisioned(identity.clone()))?;
        info!(
            "Provisioned identity {} ({})",
            identity.id, identity.display_name
        );
        Ok(identity)
    }

    fn write(&self, record: &IdentityRecord) -> Result<()> {
        let file = match record {
            IdentityRecord::Unprovisioned => IdentityFileV1 {
                version: FILE_VERSION,
                state: FileState::Unprovisioned,
                identity: None,
            },
            IdentityRecord::Provisioned(identity) => IdentityFileV1 {
                version: FILE_VERSION,
                state: FileState::Provisioned,
                identity: Some(identity.clone()),
            },
        };
        let json = serde_json::to_string_pretty(&file).map_err(ChatError::Serialization)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(ChatError::Io)?;
        fs::rename(&tmp, &self.path).map_err(ChatError::Io)?;

        // Best-effort file permissions (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chat, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Backend that only knows how to issue identities
    struct IssuingBackend {
        calls: AtomicU32,
        fail: bool,
    }

    impl IssuingBackend {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for IssuingBackend {
        async fn create_user(&self) -> Result<Identity> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(ChatError::Transport("connection refused".into()));
            }
            Ok(Identity {
                id: n as u64,
                anonymous_id: "1247".into(),
                display_name: "Anonymous #1247".into(),
                avatar_code: "A1".into(),
            })
        }
        async fn create_chat(&self, _: u64) -> Result<Chat> {
            unreachable!()
        }
        async fn join_chat(&self, _: u64, _: &str) -> Result<Chat> {
            unreachable!()
        }
        async fn list_chats(&self, _: u64) -> Result<Vec<Chat>> {
            unreachable!()
        }
        async fn list_messages(&self, _: u64, _: u64) -> Result<Vec<Message>> {
            unreachable!()
        }
        async fn send_message(&self, _: u64, _: u64, _: &str) -> Result<Message> {
            unreachable!()
        }
    }

    #[test]
    fn test_open_writes_sentinel() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path()).unwrap();

        assert_eq!(store.load().unwrap(), IdentityRecord::Unprovisioned);
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"unprovisioned\""));
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path()).unwrap();
        let backend = IssuingBackend::new(false);

        let first = store.resolve_identity(&backend).await.unwrap();
        let second = store.resolve_identity(&backend).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Survives a reopen (process restart)
        let reopened = IdentityStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            reopened.load().unwrap(),
            IdentityRecord::Provisioned(first)
        );
    }

    #[tokio::test]
    async fn test_failed_creation_is_identity_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path()).unwrap();
        let backend = IssuingBackend::new(true);

        let err = store.resolve_identity(&backend).await.unwrap_err();
        assert!(matches!(err, ChatError::IdentityUnavailable(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().unwrap(), IdentityRecord::Unprovisioned);
    }

    #[test]
    fn test_provisioned_without_identity_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path()).unwrap();
        fs::write(store.path(), r#"{"version":1,"state":"provisioned"}"#).unwrap();

        assert!(matches!(store.load(), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path()).unwrap();
        fs::write(store.path(), r#"{"version":9,"state":"unprovisioned"}"#).unwrap();

        assert!(matches!(store.load(), Err(ChatError::Config(_))));
    }
}
