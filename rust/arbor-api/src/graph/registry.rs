//! Registry of per-conversation store actors.
//!
//! Hands out the single handle for a conversation id, spawning the actor
//! on first access. A handle whose initial load failed is evicted and
//! respawned on the next access, so a transient storage fault never
//! permanently wedges a conversation.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::graph::store::ConversationHandle;
use crate::storage::SqliteStorage;

/// Registry of live conversation actors.
pub struct StoreRegistry {
    storage: SqliteStorage,
    stores: Mutex<HashMap<String, ConversationHandle>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.stores.lock();
        f.debug_struct("StoreRegistry")
            .field("conversations", &stores.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StoreRegistry {
    /// Create a registry over shared storage.
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Get the handle for a conversation, spawning its actor if needed.
    ///
    /// All concurrent callers receive the same handle; their requests
    /// queue behind the actor's one-time load.
    pub fn handle(&self, conversation_id: &str) -> ConversationHandle {
        let mut stores = self.stores.lock();

        if let Some(existing) = stores.get(conversation_id) {
            if !existing.is_poisoned() {
                return existing.clone();
            }
            tracing::warn!(
                conversation_id,
                "evicting poisoned conversation store; retrying load"
            );
            stores.remove(conversation_id);
        }

        let handle = ConversationHandle::spawn(conversation_id, self.storage.clone());
        stores.insert(conversation_id.to_string(), handle.clone());
        handle
    }

    /// Number of live actors.
    pub fn active_conversations(&self) -> usize {
        self.stores.lock().len()
    }
}
