use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use synapse_core::config::Backend;
use synapse_core::types::{Message, SamplingParams};

use crate::error::EngineError;

/// Construction parameters for the native engine.
///
/// The text backend is selectable; vision always runs on GPU and audio on
/// CPU, matching the runtime's supported configurations.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub backend: Backend,
    pub vision_backend: Backend,
    pub audio_backend: Backend,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>, backend: Backend) -> Self {
        Self {
            model_path: model_path.into(),
            backend,
            vision_backend: Backend::Gpu,
            audio_backend: Backend::Cpu,
        }
    }
}

/// Parameters for materializing one engine session (an engine-side stateful
/// context holding the KV cache for a system prompt + history prefix).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_instruction: String,
    /// Prior history replayed at session creation — everything except the
    /// final turn-triggering message, which goes through `send`.
    pub initial_messages: Vec<Message>,
    pub sampling: SamplingParams,
}

/// Events emitted while a session streams a reply. Chunks are deltas; the
/// gateway concatenates them into the full assistant message.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Delta(String),
    Done,
    Error(String),
}

/// The native LLM runtime, singleton per process.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// One-time initialization after construction. May take minutes for
    /// large models; the gateway bounds it with a timeout.
    async fn initialize(&mut self) -> Result<(), EngineError>;

    /// Materialize a session. The runtime cannot hold several sessions on
    /// constrained backends — the gateway guarantees at most one is alive.
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Box<dyn EngineSession>, EngineError>;

    async fn close(&mut self);
}

/// One materialized engine session.
#[async_trait]
pub trait EngineSession: Send {
    /// Submit one message and stream the reply on `events`: zero or more
    /// `Delta`s followed by `Done`, or a single `Error`.
    async fn send(
        &mut self,
        message: Message,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), EngineError>;

    /// Hard-stop and release the session's native resources.
    async fn close(&mut self);
}

/// Seam through which the gateway constructs engines — the binary plugs a
/// native binding in here, tests plug the mock.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn InferenceEngine>, EngineError>;
}
