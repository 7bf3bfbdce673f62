//! Deterministic in-process engine used by tests and the development
//! binary until a native runtime binding is linked through
//! [`EngineFactory`](crate::runtime::EngineFactory).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use synapse_core::config::Backend;
use synapse_core::types::{Message, SamplingParams};

use crate::error::{EngineError, Result};
use crate::runtime::{EngineConfig, EngineEvent, EngineSession, InferenceEngine, SessionConfig};

/// One scripted turn. When the script is empty the mock echoes the input
/// in two deltas (`"echo: "` + text).
#[derive(Debug, Clone)]
pub enum MockTurn {
    Deltas(Vec<String>),
    Fail(String),
}

/// What a created session looked like — lets tests assert the
/// reuse-vs-rebuild decision and the replayed prefill.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub system_instruction: String,
    pub initial_messages: usize,
    pub sampling: SamplingParams,
}

#[derive(Default)]
struct MockShared {
    fail_backends: Mutex<HashSet<Backend>>,
    script: Mutex<VecDeque<MockTurn>>,
    sessions: Mutex<Vec<SessionRecord>>,
    engines_created: AtomicUsize,
    sends: AtomicUsize,
}

/// Factory + shared observation point for all engines it creates.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    shared: Arc<MockShared>,
}

impl MockEngineFactory {
    /// Make `initialize` fail for engines constructed on this backend.
    pub fn fail_backend(&self, backend: Backend) {
        self.shared.fail_backends.lock().unwrap().insert(backend);
    }

    /// Queue a scripted turn consumed by the next `send`.
    pub fn push_turn(&self, turn: MockTurn) {
        self.shared.script.lock().unwrap().push_back(turn);
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.shared.sessions.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    pub fn engines_created(&self) -> usize {
        self.shared.engines_created.load(Ordering::Relaxed)
    }

    pub fn send_count(&self) -> usize {
        self.shared.sends.load(Ordering::Relaxed)
    }
}

impl crate::runtime::EngineFactory for MockEngineFactory {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn InferenceEngine>> {
        self.shared.engines_created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockEngine {
            shared: Arc::clone(&self.shared),
            backend: config.backend,
        }))
    }
}

struct MockEngine {
    shared: Arc<MockShared>,
    backend: Backend,
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn initialize(&mut self) -> Result<()> {
        if self.shared.fail_backends.lock().unwrap().contains(&self.backend) {
            return Err(EngineError::Engine(format!(
                "backend {} failed to initialize",
                self.backend
            )));
        }
        Ok(())
    }

    async fn create_session(&self, config: SessionConfig) -> Result<Box<dyn EngineSession>> {
        self.shared.sessions.lock().unwrap().push(SessionRecord {
            system_instruction: config.system_instruction,
            initial_messages: config.initial_messages.len(),
            sampling: config.sampling,
        });
        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&mut self) {}
}

struct MockSession {
    shared: Arc<MockShared>,
}

#[async_trait]
impl EngineSession for MockSession {
    async fn send(&mut self, message: Message, events: mpsc::Sender<EngineEvent>) -> Result<()> {
        self.shared.sends.fetch_add(1, Ordering::Relaxed);
        let turn = self
            .shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                MockTurn::Deltas(vec!["echo: ".to_string(), message.text()])
            });

        tokio::spawn(async move {
            match turn {
                MockTurn::Deltas(deltas) => {
                    for delta in deltas {
                        if events.send(EngineEvent::Delta(delta)).await.is_err() {
                            return;
                        }
                    }
                    let _ = events.send(EngineEvent::Done).await;
                }
                MockTurn::Fail(message) => {
                    let _ = events.send(EngineEvent::Error(message)).await;
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {}
}
