pub mod error;
pub mod gateway;
pub mod mock;
pub mod runtime;

pub use error::EngineError;
pub use gateway::EngineGateway;
pub use runtime::{
    EngineConfig, EngineEvent, EngineFactory, EngineSession, InferenceEngine, SessionConfig,
};
