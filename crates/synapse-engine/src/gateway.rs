use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use synapse_core::config::{Backend, MODEL_LOAD_TIMEOUT_SECS};
use synapse_core::sink::GenerationSink;
use synapse_core::types::{Message, SamplingParams};
use synapse_conversations::Conversation;

use crate::error::{EngineError, Result};
use crate::runtime::{EngineConfig, EngineEvent, EngineFactory, EngineSession, InferenceEngine, SessionConfig};

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant.";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The engine-side binding: the one logical conversation currently
/// materialized inside the runtime, with its warm KV cache.
struct ActiveBinding {
    conversation_id: String,
    session: Box<dyn EngineSession>,
    sampling: SamplingParams,
}

struct EngineState {
    engine: Option<Box<dyn InferenceEngine>>,
    model_path: Option<PathBuf>,
    backend: Option<Backend>,
    binding: Option<ActiveBinding>,
}

/// Serialized owner of the singleton native engine.
///
/// One async mutex guards everything: it is the engine lock, held for the
/// full duration of a generation including streaming, because the runtime
/// is not reentrant. Conversations that are not the active binding exist
/// only as serialized history; a turn on any of them tears down the
/// current binding and rebuilds from that history.
pub struct EngineGateway {
    factory: Box<dyn EngineFactory>,
    state: Mutex<EngineState>,
}

impl EngineGateway {
    pub fn new(factory: Box<dyn EngineFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(EngineState {
                engine: None,
                model_path: None,
                backend: None,
                binding: None,
            }),
        }
    }

    /// Load a model. A no-op when the same path is already live. A GPU
    /// init failure falls back to CPU exactly once; every other failure
    /// propagates.
    pub async fn load(&self, model_path: &Path, backend: Backend) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.engine.is_some() && state.model_path.as_deref() == Some(model_path) {
            debug!(path = %model_path.display(), "model already loaded");
            return Ok(());
        }
        close_locked(&mut state).await;

        match self.try_load(&mut state, model_path, backend).await {
            Ok(()) => Ok(()),
            Err(e) if backend == Backend::Gpu => {
                warn!(error = %e, "GPU engine init failed, falling back to CPU");
                self.try_load(&mut state, model_path, Backend::Cpu).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_load(
        &self,
        state: &mut EngineState,
        model_path: &Path,
        backend: Backend,
    ) -> Result<()> {
        let config = EngineConfig::new(model_path, backend);
        let mut engine = self.factory.create(&config)?;

        tokio::time::timeout(
            Duration::from_secs(MODEL_LOAD_TIMEOUT_SECS),
            engine.initialize(),
        )
        .await
        .map_err(|_| EngineError::LoadTimeout(MODEL_LOAD_TIMEOUT_SECS))??;

        info!(path = %model_path.display(), %backend, "engine initialized");
        state.engine = Some(engine);
        state.model_path = Some(model_path.to_path_buf());
        state.backend = Some(backend);
        Ok(())
    }

    /// Tear down the active binding, then the engine.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        close_locked(&mut state).await;
    }

    /// Run one generation turn against a conversation, streaming text
    /// deltas into `sink`. On success the full reply has been appended to
    /// the conversation's history (unless empty) and is returned for
    /// envelope encoding.
    pub async fn generate(
        &self,
        conversation: &Conversation,
        incoming: Vec<Message>,
        sink: &dyn GenerationSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(trigger) = incoming.last().cloned() else {
            return Err(EngineError::EmptyTurn);
        };

        let mut state = self.state.lock().await;
        if state.engine.is_none() {
            return Err(EngineError::ModelNotLoaded);
        }

        let sampling = conversation.sampling();
        let reuse = matches!(
            &state.binding,
            Some(b) if b.conversation_id == conversation.id()
                && incoming.len() == 1
                && b.sampling == sampling
        );

        // Record this turn's input up front: a failed generation still
        // leaves the user messages visible in history.
        conversation.append_messages(&incoming);

        if reuse {
            debug!(conversation = %conversation.id(), "reusing warm engine session");
        } else {
            self.rebuild_binding(&mut state, conversation, sampling).await?;
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let binding = state.binding.as_mut().expect("binding set above");
        if let Err(e) = binding.session.send(trigger, tx).await {
            // The session never accepted the turn; its state is unknown.
            close_binding(&mut state).await;
            return Err(e);
        }

        let mut reply = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(conversation = %conversation.id(), "generation cancelled, closing engine session");
                    close_binding(&mut state).await;
                    return Err(EngineError::Cancelled);
                }
                event = rx.recv() => match event {
                    Some(EngineEvent::Delta(delta)) => {
                        sink.on_token(&delta);
                        reply.push_str(&delta);
                    }
                    Some(EngineEvent::Done) | None => break,
                    Some(EngineEvent::Error(message)) => {
                        // The turn failed but the session survives — keep
                        // the binding warm for the next turn.
                        return Err(EngineError::Engine(message));
                    }
                },
            }
        }

        conversation.append_assistant(&reply);
        Ok(reply)
    }

    async fn rebuild_binding(
        &self,
        state: &mut EngineState,
        conversation: &Conversation,
        sampling: SamplingParams,
    ) -> Result<()> {
        close_binding(state).await;

        // Everything except the final turn-triggering message is replayed
        // as prefill; the final message goes through `send`.
        let mut initial_messages = conversation.history_snapshot();
        initial_messages.pop();

        let config = SessionConfig {
            system_instruction: conversation
                .system_instruction()
                .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION)
                .to_string(),
            initial_messages,
            sampling,
        };

        let engine = state.engine.as_ref().expect("engine checked by caller");
        let session = engine.create_session(config).await?;
        debug!(conversation = %conversation.id(), "rebuilt engine session");
        state.binding = Some(ActiveBinding {
            conversation_id: conversation.id().to_string(),
            session,
            sampling,
        });
        Ok(())
    }

    /// Invalidation callback from the conversation registry: drop the
    /// binding if it belongs to the removed conversation.
    pub async fn close_if_bound(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;
        let bound = state
            .binding
            .as_ref()
            .is_some_and(|b| b.conversation_id == conversation_id);
        if bound {
            debug!(conversation = %conversation_id, "closing engine session for removed conversation");
            close_binding(&mut state).await;
        }
    }

    /// Bridge the registry's invalidation channel into `close_if_bound`.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(conversation_id) = rx.recv().await {
                gateway.close_if_bound(&conversation_id).await;
            }
        })
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.engine.is_some()
    }

    pub async fn current_backend(&self) -> Option<Backend> {
        self.state.lock().await.backend
    }

    pub async fn has_binding_for(&self, conversation_id: &str) -> bool {
        self.state
            .lock()
            .await
            .binding
            .as_ref()
            .is_some_and(|b| b.conversation_id == conversation_id)
    }
}

async fn close_binding(state: &mut EngineState) {
    if let Some(mut binding) = state.binding.take() {
        binding.session.close().await;
    }
}

async fn close_locked(state: &mut EngineState) {
    close_binding(state).await;
    if let Some(mut engine) = state.engine.take() {
        engine.close().await;
    }
    state.model_path = None;
    state.backend = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEngineFactory, MockTurn};
    use std::sync::Mutex as StdMutex;

    struct CollectSink {
        tokens: StdMutex<Vec<String>>,
    }

    impl CollectSink {
        fn new() -> Self {
            Self {
                tokens: StdMutex::new(Vec::new()),
            }
        }
        fn joined(&self) -> String {
            self.tokens.lock().unwrap().concat()
        }
    }

    impl GenerationSink for CollectSink {
        fn on_token(&self, delta: &str) {
            self.tokens.lock().unwrap().push(delta.to_string());
        }
        fn on_complete(&self, _envelope_json: &str) {}
        fn on_error(&self, _message: &str) {}
    }

    fn conversation(ttl_ms: i64) -> Conversation {
        Conversation::new("tok".into(), Some("You are helpful.".into()), ttl_ms)
    }

    async fn loaded_gateway(factory: &MockEngineFactory) -> EngineGateway {
        let gateway = EngineGateway::new(Box::new(factory.clone()));
        gateway
            .load(Path::new("/models/test.bin"), Backend::Cpu)
            .await
            .unwrap();
        gateway
    }

    #[tokio::test]
    async fn generate_before_load_fails() {
        let gateway = EngineGateway::new(Box::new(MockEngineFactory::default()));
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let err = gateway
            .generate(&conv, vec![Message::user_text("hi")], &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelNotLoaded));
        assert_eq!(conv.history_len(), 0);
    }

    #[tokio::test]
    async fn single_message_turns_reuse_the_session() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();

        let reply = gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(reply, "echo: Hi");
        assert_eq!(sink.joined(), "echo: Hi");
        assert_eq!(conv.history_len(), 2);

        gateway
            .generate(&conv, vec![Message::user_text("Again?")], &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(conv.history_len(), 4);
        // second turn rode the warm session
        assert_eq!(factory.session_count(), 1);
        assert_eq!(factory.send_count(), 2);
    }

    #[tokio::test]
    async fn sampling_change_triggers_rebuild() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();

        gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap();
        conv.update_sampling(Some(0.1), None, None);
        gateway
            .generate(&conv, vec![Message::user_text("Again?")], &sink, &cancel)
            .await
            .unwrap();

        assert_eq!(factory.session_count(), 2);
        let sessions = factory.sessions();
        // replayed prefill: [user, assistant] from the first turn
        assert_eq!(sessions[1].initial_messages, 2);
        assert_eq!(sessions[1].sampling.temperature, 0.1);
        assert_eq!(sessions[1].sampling.top_p, 0.95);
        assert_eq!(sessions[1].sampling.top_k, 40);
    }

    #[tokio::test]
    async fn multi_message_turn_triggers_rebuild() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();

        gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap();
        gateway
            .generate(
                &conv,
                vec![Message::user_text("first"), Message::user_text("second")],
                &sink,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(factory.session_count(), 2);
        // history [u, a, u] replayed, "second" sent as the trigger
        assert_eq!(factory.sessions()[1].initial_messages, 3);

        // after the rebuild, the next single-message turn reuses again
        gateway
            .generate(&conv, vec![Message::user_text("third")], &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(factory.session_count(), 2);
    }

    #[tokio::test]
    async fn other_conversation_steals_the_binding() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let a = conversation(60_000);
        let b = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();

        gateway
            .generate(&a, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap();
        assert!(gateway.has_binding_for(a.id()).await);

        gateway
            .generate(&b, vec![Message::user_text("Hello")], &sink, &cancel)
            .await
            .unwrap();
        assert!(gateway.has_binding_for(b.id()).await);
        assert!(!gateway.has_binding_for(a.id()).await);
        assert_eq!(factory.session_count(), 2);
    }

    #[tokio::test]
    async fn streamed_error_keeps_binding_warm() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();

        gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap();
        factory.push_turn(MockTurn::Fail("thermal shutdown".into()));

        let err = gateway
            .generate(&conv, vec![Message::user_text("boom")], &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Engine(_)));
        // the user message stayed in history, no assistant reply
        assert_eq!(conv.history_len(), 3);
        assert!(gateway.has_binding_for(conv.id()).await);

        // next turn reuses the surviving session
        gateway
            .generate(&conv, vec![Message::user_text("retry")], &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(factory.session_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_tears_down_the_binding() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(!gateway.has_binding_for(conv.id()).await);
        // pre-append semantics: the user message is still recorded
        assert_eq!(conv.history_len(), 1);
    }

    #[tokio::test]
    async fn empty_reply_appends_nothing() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();

        factory.push_turn(MockTurn::Deltas(vec![]));
        let reply = gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(conv.history_len(), 1);
    }

    #[tokio::test]
    async fn gpu_init_failure_falls_back_to_cpu() {
        let factory = MockEngineFactory::default();
        factory.fail_backend(Backend::Gpu);
        let gateway = EngineGateway::new(Box::new(factory.clone()));

        gateway
            .load(Path::new("/models/test.bin"), Backend::Gpu)
            .await
            .unwrap();
        assert_eq!(gateway.current_backend().await, Some(Backend::Cpu));
    }

    #[tokio::test]
    async fn cpu_init_failure_propagates() {
        let factory = MockEngineFactory::default();
        factory.fail_backend(Backend::Cpu);
        let gateway = EngineGateway::new(Box::new(factory.clone()));

        let err = gateway
            .load(Path::new("/models/test.bin"), Backend::Cpu)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Engine(_)));
        assert!(!gateway.is_loaded().await);
    }

    #[tokio::test]
    async fn reloading_same_model_is_a_noop() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        gateway
            .load(Path::new("/models/test.bin"), Backend::Cpu)
            .await
            .unwrap();
        assert_eq!(factory.engines_created(), 1);

        gateway
            .load(Path::new("/models/other.bin"), Backend::Cpu)
            .await
            .unwrap();
        assert_eq!(factory.engines_created(), 2);
    }

    #[tokio::test]
    async fn close_if_bound_only_drops_matching_binding() {
        let factory = MockEngineFactory::default();
        let gateway = loaded_gateway(&factory).await;
        let conv = conversation(60_000);
        let sink = CollectSink::new();

        gateway
            .generate(&conv, vec![Message::user_text("Hi")], &sink, &CancellationToken::new())
            .await
            .unwrap();

        gateway.close_if_bound("someone-else").await;
        assert!(gateway.has_binding_for(conv.id()).await);

        gateway.close_if_bound(conv.id()).await;
        assert!(!gateway.has_binding_for(conv.id()).await);
    }
}
