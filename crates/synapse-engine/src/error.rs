use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("model load timed out after {0}s")]
    LoadTimeout(u64),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("no message to submit")]
    EmptyTurn,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
