use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::dispatcher::Dispatcher;

pub mod health;
pub mod openai_compat;

/// Assemble the optional OpenAI-compatible HTTP surface.
pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/v1/chat/completions",
            post(openai_compat::chat_completions),
        )
        .with_state(dispatcher)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
