use thiserror::Error;

/// Errors raised while opening or loading the token store.
///
/// Runtime persistence failures are deliberately NOT represented here —
/// they are logged and swallowed, and the in-memory state stays
/// authoritative for the process lifetime.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
