use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use castline_types::{ChatSummary, ConversationId};

use crate::error::{ChatError, Result};
use crate::identity::ViewerIdentity;

/// Keys shared with the authentication collaborator.
pub mod keys {
    /// Opaque bearer credential.
    pub const TOKEN: &str = "token";
    /// JSON user record; only its numeric `id` is read here.
    pub const USER: &str = "user";
    pub const LAST_CHAT_ID: &str = "lastChatId";
}

/// Small string key-value store that outlives a chat session.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> ChatError {
    ChatError::Store(format!("store lock poisoned: {}", e))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten whole on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens `path`, starting empty if it does not exist or cannot be parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Session store {} is corrupt ({}), starting empty", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(ChatError::Store(format!("read {}: {}", path.display(), e))),
        };

        info!("Session store opened at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| ChatError::Store(format!("encode: {}", e)))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| ChatError::Store(format!("write {}: {}", self.path.display(), e)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

/// Per-user state the chat screen needs across remounts, read from a
/// [`KeyValueStore`] instead of ambient globals.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub viewer: ViewerIdentity,
    pub credential: Option<String>,
    pub last_conversation: Option<ConversationId>,
}

impl SessionContext {
    pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let user = store.get(keys::USER)?;
        Ok(Self {
            viewer: ViewerIdentity::from_stored_user(user.as_deref()),
            credential: store.get(keys::TOKEN)?.filter(|t| !t.is_empty()),
            last_conversation: store.get(keys::LAST_CHAT_ID)?.and_then(|raw| ConversationId::new(raw)),
        })
    }

    pub fn remember_conversation(
        &mut self,
        store: &dyn KeyValueStore,
        conversation: &ConversationId,
    ) -> Result<()> {
        store.set(keys::LAST_CHAT_ID, conversation.as_str())?;
        self.last_conversation = Some(conversation.clone());
        Ok(())
    }

    /// The last viewed conversation, else the first listed one.
    pub fn initial_conversation(&self, summaries: &[ChatSummary]) -> Option<ConversationId> {
        self.last_conversation
            .clone()
            .or_else(|| summaries.first().map(|s| s.conversation_id.clone()))
    }
}
