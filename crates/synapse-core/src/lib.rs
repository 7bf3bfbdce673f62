pub mod config;
pub mod error;
pub mod sink;
pub mod types;

pub use error::{GatewayError, Result};
pub use sink::GenerationSink;
pub use types::{ContentPart, Message, Role, SamplingParams};
