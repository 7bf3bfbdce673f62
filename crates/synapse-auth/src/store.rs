use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use dashmap::DashSet;
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::Result;

const KEY_APPROVED: &str = "approved_tokens";
const KEY_PENDING: &str = "pending_requests";

/// Outcome of a caller asking for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    /// The caller already holds an approved token (returned verbatim).
    Approved(String),
    /// The caller is queued for manual approval.
    Pending,
}

/// Per-caller bearer-token store with manual approval.
///
/// `caller_id -> token` is a partial function and `token -> caller_id` is
/// injective; both directions are O(1). A single mutex serializes every
/// mutation; `validate` reads a lock-free set so the per-request hot path
/// never contends with approvals.
///
/// Approved tokens are written to the primary key-value store and mirrored
/// to a flat backup file. Persistence failures are logged and swallowed —
/// the in-memory maps are authoritative within a process lifetime.
pub struct TokenStore {
    state: Mutex<TokenState>,
    /// Lock-free mirror of the approved token set for `validate`.
    approved: DashSet<String>,
    conn: Mutex<Connection>,
    backup_path: PathBuf,
}

struct TokenState {
    by_caller: HashMap<String, String>,
    by_token: HashMap<String, String>,
    pending: HashSet<String>,
}

impl TokenStore {
    /// Wrap an open connection, initialise the table, and load persisted
    /// tokens — the primary store first, the flat backup if the primary is
    /// empty or unparsable.
    pub fn new(conn: Connection, backup_path: impl Into<PathBuf>) -> Result<Self> {
        db::init_db(&conn)?;
        let backup_path = backup_path.into();

        let by_caller = load_approved(&conn, &backup_path);
        let by_token: HashMap<String, String> = by_caller
            .iter()
            .map(|(caller, token)| (token.clone(), caller.clone()))
            .collect();
        let pending = load_pending(&conn);

        let approved = DashSet::new();
        for token in by_token.keys() {
            approved.insert(token.clone());
        }

        info!(
            approved = by_caller.len(),
            pending = pending.len(),
            "token store loaded"
        );

        Ok(Self {
            state: Mutex::new(TokenState {
                by_caller,
                by_token,
                pending,
            }),
            approved,
            conn: Mutex::new(conn),
            backup_path,
        })
    }

    /// Return the caller's token if approved, otherwise queue the caller
    /// for approval. Idempotent — repeat calls while pending do not
    /// duplicate the request.
    pub fn request_token(&self, caller_id: &str) -> TokenRequest {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.by_caller.get(caller_id) {
            return TokenRequest::Approved(token.clone());
        }
        if state.pending.insert(caller_id.to_string()) {
            info!(caller = %caller_id, "new token request pending approval");
            self.persist_pending(&state);
        } else {
            debug!(caller = %caller_id, "token request already pending");
        }
        TokenRequest::Pending
    }

    /// Approve a pending caller, minting a fresh token. Returns the
    /// existing token when the caller is already approved, and `None` when
    /// the caller is neither pending nor approved.
    pub fn approve(&self, caller_id: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.by_caller.get(caller_id) {
            return Some(token.clone());
        }
        if !state.pending.remove(caller_id) {
            return None;
        }

        let token = Uuid::new_v4().to_string();
        state
            .by_caller
            .insert(caller_id.to_string(), token.clone());
        state
            .by_token
            .insert(token.clone(), caller_id.to_string());
        self.approved.insert(token.clone());

        info!(caller = %caller_id, "token approved");
        self.persist_approved(&state);
        self.persist_pending(&state);
        Some(token)
    }

    /// Remove a caller from the pending set. No-op when absent.
    pub fn deny(&self, caller_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(caller_id) {
            info!(caller = %caller_id, "token request denied");
            self.persist_pending(&state);
        }
    }

    /// Remove a token. Returns whether it was found. Does NOT close the
    /// token's conversations — the dispatcher cascades that.
    pub fn revoke(&self, token: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(caller) = state.by_token.remove(token) else {
            return false;
        };
        state.by_caller.remove(&caller);
        self.approved.remove(token);
        info!(caller = %caller, "token revoked");
        self.persist_approved(&state);
        true
    }

    /// O(1) lock-free check that a token is currently approved.
    pub fn validate(&self, token: &str) -> bool {
        self.approved.contains(token)
    }

    /// Caller identity bound to a token, if approved.
    pub fn caller_for(&self, token: &str) -> Option<String> {
        self.state.lock().unwrap().by_token.get(token).cloned()
    }

    /// Snapshot of callers awaiting approval. No ordering guarantee.
    pub fn pending(&self) -> Vec<String> {
        self.state.lock().unwrap().pending.iter().cloned().collect()
    }

    pub fn approved_count(&self) -> usize {
        self.state.lock().unwrap().by_caller.len()
    }

    // ── persistence ──────────────────────────────────────────────────────

    fn persist_approved(&self, state: &TokenState) {
        let json = match serde_json::to_string(&state.by_caller) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize approved tokens");
                return;
            }
        };

        let conn = self.conn.lock().unwrap();
        if let Err(e) = db::kv_put(&conn, KEY_APPROVED, &json) {
            warn!(error = %e, "failed to persist approved tokens");
        }
        drop(conn);

        if let Err(e) = std::fs::write(&self.backup_path, &json) {
            warn!(path = %self.backup_path.display(), error = %e, "failed to write token backup");
        }
    }

    fn persist_pending(&self, state: &TokenState) {
        let list: Vec<&String> = state.pending.iter().collect();
        let json = match serde_json::to_string(&list) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize pending requests");
                return;
            }
        };
        let conn = self.conn.lock().unwrap();
        if let Err(e) = db::kv_put(&conn, KEY_PENDING, &json) {
            warn!(error = %e, "failed to persist pending requests");
        }
    }
}

/// Primary store first; fall back to the flat backup file when the primary
/// is missing, empty, or unparsable.
fn load_approved(conn: &Connection, backup_path: &PathBuf) -> HashMap<String, String> {
    match db::kv_get(conn, KEY_APPROVED) {
        Ok(Some(json)) => match serde_json::from_str::<HashMap<String, String>>(&json) {
            Ok(map) if !map.is_empty() => return map,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "approved_tokens unparsable, trying backup"),
        },
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to read approved_tokens, trying backup"),
    }

    match std::fs::read_to_string(backup_path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(map) => {
                info!(path = %backup_path.display(), "restored approved tokens from backup");
                map
            }
            Err(e) => {
                warn!(error = %e, "token backup unparsable");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Loss of pending requests is acceptable — callers re-request.
fn load_pending(conn: &Connection) -> HashSet<String> {
    match db::kv_get(conn, KEY_PENDING) {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
        _ => HashSet::new(),
    }
}
