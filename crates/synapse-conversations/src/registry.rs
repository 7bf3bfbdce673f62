use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::store::ConversationStore;
use crate::types::Conversation;

/// Result of resolving a conversation for a presenting token.
pub enum Lookup {
    Found(Arc<Conversation>),
    NotFound,
    /// The presenting token is not the owner. The entry's lifetime is not
    /// touched — failed auth must never extend a TTL window.
    Unauthorized,
    /// The entry outlived its TTL; it has been evicted as a side effect.
    Expired,
}

/// Owner of the set of live conversations.
///
/// Backed by a concurrent map; every removal path (close, revocation
/// cascade, expiry, sweeper) deletes the on-disk file and publishes the
/// conversation id on the invalidation channel so the engine side can drop
/// a matching active binding.
pub struct ConversationRegistry {
    conversations: DashMap<String, Arc<Conversation>>,
    store: ConversationStore,
    default_ttl_ms: i64,
    invalidations: mpsc::UnboundedSender<String>,
}

impl ConversationRegistry {
    /// Returns the registry plus the receiving end of the invalidation
    /// channel — hand it to the engine gateway's listener.
    pub fn new(
        store: ConversationStore,
        default_ttl_ms: i64,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conversations: DashMap::new(),
                store,
                default_ttl_ms,
                invalidations: tx,
            },
            rx,
        )
    }

    /// Mint and register a new conversation. `ttl_ms <= 0` selects the
    /// configured default.
    #[instrument(skip(self, owner_token, system_instruction))]
    pub fn create(
        &self,
        owner_token: &str,
        system_instruction: Option<String>,
        ttl_ms: i64,
    ) -> Arc<Conversation> {
        let ttl = if ttl_ms <= 0 {
            self.default_ttl_ms
        } else {
            ttl_ms
        };
        let conv = Arc::new(Conversation::new(
            owner_token.to_string(),
            system_instruction,
            ttl,
        ));
        info!(conversation = %conv.id(), ttl_ms = ttl, "conversation created");
        self.conversations
            .insert(conv.id().to_string(), conv.clone());
        self.store.write(conv.snapshot());
        conv
    }

    /// Authenticated resolution that feeds a turn: touches the TTL window
    /// and persists the bumped access time.
    pub fn lookup(&self, conversation_id: &str, presenting_token: &str) -> Lookup {
        match self.resolve(conversation_id, presenting_token) {
            Lookup::Found(conv) => {
                conv.touch();
                self.store.write(conv.snapshot());
                Lookup::Found(conv)
            }
            other => other,
        }
    }

    /// Authenticated metadata read: same checks as `lookup` but the TTL
    /// window is left alone.
    pub fn peek(&self, conversation_id: &str, presenting_token: &str) -> Lookup {
        self.resolve(conversation_id, presenting_token)
    }

    fn resolve(&self, conversation_id: &str, presenting_token: &str) -> Lookup {
        let Some(conv) = self.conversations.get(conversation_id).map(|e| e.clone()) else {
            return Lookup::NotFound;
        };
        if conv.owner_token() != presenting_token {
            return Lookup::Unauthorized;
        }
        if conv.is_expired() {
            self.evict(conversation_id);
            return Lookup::Expired;
        }
        Lookup::Found(conv)
    }

    /// Authenticated close. Returns whether a conversation was removed.
    pub fn close(&self, conversation_id: &str, presenting_token: &str) -> bool {
        match self.resolve(conversation_id, presenting_token) {
            Lookup::Found(_) => {
                self.evict(conversation_id);
                true
            }
            _ => false,
        }
    }

    /// Bulk close during token revocation.
    pub fn close_all_for(&self, owner_token: &str) -> usize {
        let ids: Vec<String> = self
            .conversations
            .iter()
            .filter(|e| e.value().owner_token() == owner_token)
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.evict(id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "closed conversations for revoked token");
        }
        ids.len()
    }

    /// Persist the current state of a conversation (e.g. after a turn
    /// appended the assistant reply).
    pub fn persist(&self, conv: &Conversation) {
        self.store.write(conv.snapshot());
    }

    /// Insert a record reloaded from disk.
    pub fn insert_loaded(&self, conv: Conversation) {
        self.conversations
            .insert(conv.id().to_string(), Arc::new(conv));
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// One sweeper pass. Returns the number of evicted conversations.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .conversations
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            debug!(conversation = %id, "sweeper evicting expired conversation");
            self.evict(id);
        }
        expired.len()
    }

    /// Long-running cooperative eviction loop.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_expired();
                if evicted > 0 {
                    info!(evicted, "sweeper pass complete");
                }
            }
        })
    }

    fn evict(&self, conversation_id: &str) {
        if self.conversations.remove(conversation_id).is_some() {
            self.store.delete(conversation_id);
            let _ = self.invalidations.send(conversation_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> (ConversationRegistry, mpsc::UnboundedReceiver<String>) {
        let store = ConversationStore::open(dir.path()).unwrap();
        ConversationRegistry::new(store, 1_800_000)
    }

    #[tokio::test]
    async fn create_applies_default_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _rx) = registry(&dir);
        let conv = reg.create("tok", None, 0);
        assert_eq!(conv.ttl_ms(), 1_800_000);
        let conv = reg.create("tok", None, 5_000);
        assert_eq!(conv.ttl_ms(), 5_000);
    }

    #[tokio::test]
    async fn lookup_touches_but_unauthorized_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _rx) = registry(&dir);
        let conv = reg.create("owner", None, 60_000);
        let before = conv.last_access_ms();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(reg.lookup(conv.id(), "intruder"), Lookup::Unauthorized));
        assert_eq!(conv.last_access_ms(), before);

        assert!(matches!(reg.lookup(conv.id(), "owner"), Lookup::Found(_)));
        assert!(conv.last_access_ms() > before);
    }

    #[tokio::test]
    async fn expired_lookup_evicts_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, mut rx) = registry(&dir);
        let conv = reg.create("owner", None, 30);
        let id = conv.id().to_string();
        drop(conv);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(reg.lookup(&id, "owner"), Lookup::Expired));
        assert!(matches!(reg.lookup(&id, "owner"), Lookup::NotFound));
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn close_requires_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _rx) = registry(&dir);
        let conv = reg.create("owner", None, 60_000);

        assert!(!reg.close(conv.id(), "intruder"));
        assert_eq!(reg.len(), 1);
        assert!(reg.close(conv.id(), "owner"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn close_all_for_removes_only_that_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _rx) = registry(&dir);
        reg.create("t1", None, 60_000);
        reg.create("t1", None, 60_000);
        let other = reg.create("t2", None, 60_000);

        assert_eq!(reg.close_all_for("t1"), 2);
        assert_eq!(reg.len(), 1);
        assert!(matches!(reg.lookup(other.id(), "t2"), Lookup::Found(_)));
    }

    #[tokio::test]
    async fn sweeper_evicts_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, mut rx) = registry(&dir);
        let short = reg.create("tok", None, 20);
        let long = reg.create("tok", None, 60_000);
        let short_id = short.id().to_string();
        drop(short);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reg.sweep_expired(), 1);
        assert_eq!(rx.recv().await, Some(short_id));
        assert!(matches!(reg.lookup(long.id(), "tok"), Lookup::Found(_)));
    }
}
