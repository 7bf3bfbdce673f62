use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid API token")]
    InvalidToken,

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Not authorized for conversation {id}")]
    Unauthorized { id: String },

    #[error("Conversation expired: {id}")]
    Expired { id: String },

    #[error("Model is not loaded")]
    ModelNotLoaded,

    #[error("Engine failure: {0}")]
    Engine(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Short error code string for structured client responses.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidToken => "INVALID_TOKEN",
            GatewayError::ConversationNotFound { .. } => "NOT_FOUND",
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::Expired { .. } => "EXPIRED",
            GatewayError::ModelNotLoaded => "MODEL_NOT_LOADED",
            GatewayError::Engine(_) => "ENGINE_FAILURE",
            GatewayError::Cancelled => "CANCELLED",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
