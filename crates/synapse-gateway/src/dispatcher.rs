use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use synapse_auth::{TokenRequest, TokenStore};
use synapse_conversations::{Conversation, ConversationRegistry, Lookup};
use synapse_core::config::PENDING_APPROVAL;
use synapse_core::sink::GenerationSink;
use synapse_engine::{EngineError, EngineGateway};
use synapse_protocol::envelope::{error_json, success_json, ConversationInfo};
use synapse_protocol::wire::{ChatRequest, CodecError};
use synapse_protocol::ChatCompletion;

use crate::events::EventBroadcaster;

/// One message for not-found, unauthorized, and expired alike — a caller
/// probing someone else's conversation learns nothing about its existence.
const CONVERSATION_ERROR: &str = "Conversation not found, expired, or unauthorized";
const INVALID_TOKEN_ERROR: &str = "Invalid API token";

/// Entry layer for all client-visible operations.
///
/// Authenticates every call against the token store, routes to the
/// registry and engine gateway, keeps the active-request counter, and
/// turns internal errors into structured JSON responses.
pub struct Dispatcher {
    tokens: Arc<TokenStore>,
    registry: Arc<ConversationRegistry>,
    engine: Arc<EngineGateway>,
    events: EventBroadcaster,
    active_requests: Arc<AtomicI64>,
    host_caller: String,
}

impl Dispatcher {
    pub fn new(
        tokens: Arc<TokenStore>,
        registry: Arc<ConversationRegistry>,
        engine: Arc<EngineGateway>,
        host_caller: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            registry,
            engine,
            events: EventBroadcaster::new(),
            active_requests: Arc::new(AtomicI64::new(0)),
            host_caller: host_caller.into(),
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.events.subscribe()
    }

    // ── token lifecycle ──────────────────────────────────────────────────

    /// Returns the caller's token, or the pending sentinel while the host
    /// has not acted on the request yet.
    pub fn request_token(&self, caller_id: &str) -> String {
        match self.tokens.request_token(caller_id) {
            TokenRequest::Approved(token) => token,
            TokenRequest::Pending => {
                self.emit("token.pending", caller_id);
                PENDING_APPROVAL.to_string()
            }
        }
    }

    /// Host-only: approve a pending caller and mint its token.
    pub fn approve_request(&self, caller_id: &str, requester: &str) -> Option<String> {
        if !self.is_host(requester, "approve_request") {
            return None;
        }
        self.tokens.approve(caller_id)
    }

    /// Host-only: drop a pending request.
    pub fn deny_request(&self, caller_id: &str, requester: &str) {
        if self.is_host(requester, "deny_request") {
            self.tokens.deny(caller_id);
        }
    }

    /// Host-only: callers awaiting approval.
    pub fn pending_requests(&self, requester: &str) -> Vec<String> {
        if !self.is_host(requester, "pending_requests") {
            return Vec::new();
        }
        self.tokens.pending()
    }

    /// Host-only. Revocation cascades: every conversation owned by the
    /// token is closed, deleted from disk, and unbound from the engine.
    #[instrument(skip(self, token))]
    pub fn revoke_token(&self, token: &str, requester: &str) -> bool {
        if !self.is_host(requester, "revoke_token") {
            return false;
        }
        let revoked = self.tokens.revoke(token);
        if revoked {
            let closed = self.registry.close_all_for(token);
            info!(closed, "token revoked, conversations cascaded");
            self.emit("token.revoked", "");
        }
        revoked
    }

    fn is_host(&self, requester: &str, operation: &str) -> bool {
        if requester == self.host_caller {
            return true;
        }
        warn!(caller = %requester, operation, "rejected host-only operation");
        false
    }

    // ── conversation management ──────────────────────────────────────────

    pub fn start_conversation(
        &self,
        token: &str,
        system_instruction: Option<String>,
        ttl_ms: i64,
    ) -> String {
        if !self.tokens.validate(token) {
            return error_json(INVALID_TOKEN_ERROR);
        }
        let conv = self.registry.create(token, system_instruction, ttl_ms);
        self.emit("conversation.started", conv.id());
        info_json(&conv)
    }

    pub fn close_conversation(&self, token: &str, conversation_id: &str) -> String {
        if !self.tokens.validate(token) {
            return error_json(INVALID_TOKEN_ERROR);
        }
        if self.registry.close(conversation_id, token) {
            self.emit("conversation.closed", conversation_id);
            success_json()
        } else {
            error_json(CONVERSATION_ERROR)
        }
    }

    /// Metadata read. Does not extend the TTL window — only reads that
    /// feed a turn do.
    pub fn conversation_info(&self, token: &str, conversation_id: &str) -> String {
        if !self.tokens.validate(token) {
            return error_json(INVALID_TOKEN_ERROR);
        }
        match self.registry.peek(conversation_id, token) {
            Lookup::Found(conv) => info_json(&conv),
            _ => error_json(CONVERSATION_ERROR),
        }
    }

    // ── generation ───────────────────────────────────────────────────────

    /// Run one streaming generation. All outcomes are delivered through
    /// the sink: any number of `on_token` calls followed by exactly one
    /// terminal `on_complete` or `on_error`.
    pub async fn generate(
        &self,
        token: &str,
        conversation_id: &str,
        request_json: &str,
        sink: Arc<dyn GenerationSink>,
        cancel: CancellationToken,
    ) {
        let sink = RequestSink::new(sink, Arc::clone(&self.active_requests));

        if !self.tokens.validate(token) {
            sink.on_error(INVALID_TOKEN_ERROR);
            return;
        }

        let request = match ChatRequest::parse(request_json) {
            Ok(r) => r,
            Err(CodecError::NoMessages) => {
                sink.on_error("No messages provided");
                return;
            }
            Err(e) => {
                sink.on_error(&e.to_string());
                return;
            }
        };

        let conv = match self.registry.lookup(conversation_id, token) {
            Lookup::Found(conv) => conv,
            _ => {
                sink.on_error(CONVERSATION_ERROR);
                return;
            }
        };

        conv.update_sampling(request.temperature, request.top_p, request.top_k);
        let incoming = request.decode_messages();

        self.emit("generate.start", conversation_id);
        let result = self
            .engine
            .generate(&conv, incoming, &sink, &cancel)
            .await;

        match result {
            Ok(reply) => {
                self.registry.persist(&conv);
                let envelope = ChatCompletion::new(request.model.as_deref(), reply);
                sink.on_complete(&envelope.to_json());
                self.emit("generate.done", conversation_id);
            }
            Err(e) => {
                sink.on_error(&client_message(&e));
                self.emit("generate.error", conversation_id);
            }
        }
    }

    // ── liveness ─────────────────────────────────────────────────────────

    pub fn ping(&self, token: &str) -> String {
        if self.tokens.validate(token) {
            "pong".to_string()
        } else {
            "error: invalid token".to_string()
        }
    }

    pub fn health(&self, token: &str) -> String {
        if self.tokens.validate(token) {
            "ok".to_string()
        } else {
            "error: invalid token".to_string()
        }
    }

    /// Current number of in-flight generations, or -1 for a bad token.
    pub fn load(&self, token: &str) -> i64 {
        if self.tokens.validate(token) {
            self.active_requests.load(Ordering::SeqCst)
        } else {
            -1
        }
    }

    fn emit(&self, event: &str, detail: &str) {
        let payload = serde_json::json!({ "event": event, "detail": detail }).to_string();
        self.events.send(payload);
    }
}

fn info_json(conv: &Conversation) -> String {
    let info = ConversationInfo {
        conversation_id: conv.id().to_string(),
        ttl_ms: conv.ttl_ms(),
        created_at: conv.created_at(),
        last_access_time: conv.last_access_ms(),
        expires_at: conv.expires_at(),
        remaining_ttl_ms: conv.remaining_ttl_ms(),
    };
    serde_json::to_string(&info).unwrap_or_else(|_| error_json("encoding failed"))
}

/// Client-facing message for an engine-side failure. Engine failures are
/// surfaced verbatim; the rest map to stable strings.
fn client_message(err: &EngineError) -> String {
    match err {
        EngineError::Cancelled => "cancelled".to_string(),
        EngineError::ModelNotLoaded => "Model not loaded".to_string(),
        EngineError::EmptyTurn => "No messages provided".to_string(),
        EngineError::Engine(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Sink wrapper enforcing the single-shot terminal discipline and tying
/// the active-request counter to the request lifetime: incremented at
/// creation, decremented exactly once when a terminal event fires.
struct RequestSink {
    inner: Arc<dyn GenerationSink>,
    terminal: AtomicBool,
    active_requests: Arc<AtomicI64>,
}

impl RequestSink {
    fn new(inner: Arc<dyn GenerationSink>, active_requests: Arc<AtomicI64>) -> Self {
        active_requests.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            terminal: AtomicBool::new(false),
            active_requests,
        }
    }

    fn fire_terminal(&self) -> bool {
        let first = !self.terminal.swap(true, Ordering::SeqCst);
        if first {
            self.active_requests.fetch_sub(1, Ordering::SeqCst);
        }
        first
    }
}

impl GenerationSink for RequestSink {
    fn on_token(&self, delta: &str) {
        if !self.terminal.load(Ordering::SeqCst) {
            self.inner.on_token(delta);
        }
    }

    fn on_complete(&self, envelope_json: &str) {
        if self.fire_terminal() {
            self.inner.on_complete(envelope_json);
        }
    }

    fn on_error(&self, message: &str) {
        if self.fire_terminal() {
            self.inner.on_error(message);
        }
    }
}

impl Drop for RequestSink {
    fn drop(&mut self) {
        // A request abandoned without a terminal event (e.g. the future was
        // dropped mid-await) must still release its counter slot.
        self.fire_terminal();
    }
}
