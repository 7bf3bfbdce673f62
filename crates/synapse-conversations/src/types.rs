use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use synapse_core::types::{Message, Role, SamplingParams};

/// Wall-clock milliseconds, the time base for TTL accounting.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A live multi-turn conversation owned by one token.
///
/// Identity, owner, system instruction, and TTL are fixed at creation.
/// `last_access_ms` is a plain atomic so `touch` never takes a lock;
/// history and sampling share a mutex — per-entry writes are already
/// bounded to one generator at a time by the engine lock.
///
/// The engine-side binding (KV cache) is never part of this type: the
/// engine gateway owns engine handles, and a reloaded conversation is
/// always "cold" until its first turn rebuilds one.
pub struct Conversation {
    id: String,
    owner_token: String,
    system_instruction: Option<String>,
    ttl_ms: i64,
    created_at: i64,
    last_access_ms: AtomicI64,
    state: Mutex<ConversationState>,
}

struct ConversationState {
    history: Vec<Message>,
    sampling: SamplingParams,
}

impl Conversation {
    pub fn new(owner_token: String, system_instruction: Option<String>, ttl_ms: i64) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            owner_token,
            system_instruction,
            ttl_ms,
            created_at: now,
            last_access_ms: AtomicI64::new(now),
            state: Mutex::new(ConversationState {
                history: Vec::new(),
                sampling: SamplingParams::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref()
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Reset the sliding TTL window to now.
    pub fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_expired(&self) -> bool {
        now_ms() - self.last_access_ms() > self.ttl_ms
    }

    pub fn expires_at(&self) -> i64 {
        self.last_access_ms() + self.ttl_ms
    }

    pub fn remaining_ttl_ms(&self) -> i64 {
        (self.expires_at() - now_ms()).max(0)
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    pub fn history_snapshot(&self) -> Vec<Message> {
        self.state.lock().unwrap().history.clone()
    }

    /// Append this turn's incoming messages. Called before the engine is
    /// invoked so a failed generation still leaves the input visible.
    pub fn append_messages(&self, messages: &[Message]) {
        self.state
            .lock()
            .unwrap()
            .history
            .extend_from_slice(messages);
    }

    /// Append the assistant's reply. Empty replies append nothing.
    pub fn append_assistant(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.state
            .lock()
            .unwrap()
            .history
            .push(Message::assistant_text(text));
    }

    pub fn sampling(&self) -> SamplingParams {
        self.state.lock().unwrap().sampling
    }

    /// Apply per-request sampling overrides ahead of a turn. Fields left
    /// `None` keep their current value.
    pub fn update_sampling(
        &self,
        temperature: Option<f64>,
        top_p: Option<f64>,
        top_k: Option<u32>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = temperature {
            state.sampling.temperature = t;
        }
        if let Some(p) = top_p {
            state.sampling.top_p = p;
        }
        if let Some(k) = top_k {
            state.sampling.top_k = k;
        }
    }

    /// Serializable snapshot for the on-disk store.
    pub fn snapshot(&self) -> ConversationRecord {
        let state = self.state.lock().unwrap();
        ConversationRecord {
            id: self.id.clone(),
            owner_token: self.owner_token.clone(),
            system_instruction: self.system_instruction.clone(),
            ttl_ms: self.ttl_ms,
            created_at: self.created_at,
            last_access_ms: self.last_access_ms(),
            history: state.history.clone(),
            sampling: state.sampling,
        }
    }

    /// Rehydrate from a persisted record. The engine binding is gone — the
    /// first turn after a reload always rebuilds.
    pub fn from_record(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            owner_token: record.owner_token,
            system_instruction: record.system_instruction,
            ttl_ms: record.ttl_ms,
            created_at: record.created_at,
            last_access_ms: AtomicI64::new(record.last_access_ms),
            state: Mutex::new(ConversationState {
                history: record.history,
                sampling: record.sampling,
            }),
        }
    }

    /// Count of assistant messages in history.
    pub fn assistant_replies(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }
}

/// The persisted form of a conversation — everything except the engine
/// binding, which is a native handle and cannot survive the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub owner_token: String,
    pub system_instruction: Option<String>,
    pub ttl_ms: i64,
    pub created_at: i64,
    pub last_access_ms: i64,
    pub history: Vec<Message>,
    pub sampling: SamplingParams,
}

impl ConversationRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.last_access_ms > self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::types::ContentPart;

    #[test]
    fn id_is_plain_hex() {
        let conv = Conversation::new("tok".into(), None, 1000);
        assert_eq!(conv.id().len(), 32);
        assert!(conv.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn expiry_follows_last_access() {
        let conv = Conversation::new("tok".into(), None, 50);
        assert!(!conv.is_expired());
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert!(conv.is_expired());
        conv.touch();
        assert!(!conv.is_expired());
    }

    #[test]
    fn empty_assistant_reply_appends_nothing() {
        let conv = Conversation::new("tok".into(), None, 1000);
        conv.append_messages(&[Message::user_text("hi")]);
        conv.append_assistant("");
        assert_eq!(conv.history_len(), 1);
        conv.append_assistant("hello");
        assert_eq!(conv.history_len(), 2);
        assert_eq!(conv.assistant_replies(), 1);
    }

    #[test]
    fn sampling_overrides_are_partial() {
        let conv = Conversation::new("tok".into(), None, 1000);
        conv.update_sampling(Some(0.1), None, None);
        let s = conv.sampling();
        assert_eq!(s.temperature, 0.1);
        assert_eq!(s.top_p, 0.95);
        assert_eq!(s.top_k, 40);
    }

    #[test]
    fn record_round_trip_preserves_history() {
        let conv = Conversation::new("tok".into(), Some("Be brief.".into()), 60_000);
        conv.append_messages(&[Message::new(
            Role::User,
            vec![
                ContentPart::text("see"),
                ContentPart::Image {
                    data: vec![9, 9],
                    mime: "image/png".into(),
                },
            ],
        )]);
        conv.append_assistant("ok");

        let json = serde_json::to_string(&conv.snapshot()).unwrap();
        let record: ConversationRecord = serde_json::from_str(&json).unwrap();
        let back = Conversation::from_record(record);

        assert_eq!(back.id(), conv.id());
        assert_eq!(back.system_instruction(), Some("Be brief."));
        assert_eq!(back.history_snapshot(), conv.history_snapshot());
    }
}
