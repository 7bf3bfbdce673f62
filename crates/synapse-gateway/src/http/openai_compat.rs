//! OpenAI-compatible /v1/chat/completions endpoint.
//!
//! A thin client of the dispatcher for HTTP-capable callers: bearer-token
//! auth, optional `conversation_id` routing, and SSE streaming when the
//! body sets `"stream": true`. Without a `conversation_id` the request
//! runs in a one-shot conversation that is closed after the reply.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use synapse_core::sink::GenerationSink;
use synapse_protocol::envelope::error_json;
use synapse_protocol::ConversationInfo;

use crate::dispatcher::Dispatcher;

pub async fn chat_completions(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            error_json("Missing 'Authorization: Bearer <token>' header"),
        )
            .into_response();
    };

    let shim_fields: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
    let stream = shim_fields
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let routed_conversation = shim_fields
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    // Resolve the target conversation; absent an explicit id the request
    // runs one-shot.
    let (conversation_id, one_shot) = match &routed_conversation {
        Some(id) => (id.clone(), false),
        None => {
            let info = dispatcher.start_conversation(&token, None, 0);
            match serde_json::from_str::<ConversationInfo>(&info) {
                Ok(info) => (info.conversation_id, true),
                Err(_) => {
                    // start_conversation returned an error envelope
                    return (StatusCode::UNAUTHORIZED, info).into_response();
                }
            }
        }
    };

    if stream {
        streaming_response(dispatcher, token, conversation_id, one_shot, body).into_response()
    } else {
        buffered_response(dispatcher, token, conversation_id, one_shot, body)
            .await
            .into_response()
    }
}

async fn buffered_response(
    dispatcher: Arc<Dispatcher>,
    token: String,
    conversation_id: String,
    one_shot: bool,
    body: String,
) -> axum::response::Response {
    let (sink, mut rx) = ChannelSink::new();
    dispatcher
        .generate(
            &token,
            &conversation_id,
            &body,
            Arc::new(sink),
            CancellationToken::new(),
        )
        .await;
    if one_shot {
        dispatcher.close_conversation(&token, &conversation_id);
    }

    while let Some(event) = rx.recv().await {
        match event {
            SinkEvent::Token(_) => continue,
            SinkEvent::Complete(envelope) => {
                return (StatusCode::OK, envelope).into_response();
            }
            SinkEvent::Error(message) => {
                warn!(error = %message, "chat completion failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, error_json(&message))
                    .into_response();
            }
        }
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        error_json("generation ended without a terminal event"),
    )
        .into_response()
}

fn streaming_response(
    dispatcher: Arc<Dispatcher>,
    token: String,
    conversation_id: String,
    one_shot: bool,
    body: String,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (sink, mut rx) = ChannelSink::new();
    let cancel = CancellationToken::new();
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        let (token, conversation_id) = (token.clone(), conversation_id.clone());
        tokio::spawn(async move {
            dispatcher
                .generate(&token, &conversation_id, &body, Arc::new(sink), cancel)
                .await;
            if one_shot {
                dispatcher.close_conversation(&token, &conversation_id);
            }
        });
    }

    let stream = async_stream::stream! {
        // Dropping the SSE stream (client went away) cancels the generation.
        let _guard = cancel.drop_guard();
        while let Some(event) = rx.recv().await {
            match event {
                SinkEvent::Token(delta) => {
                    let chunk = ChunkEnvelope::delta(&id, delta);
                    yield Ok(Event::default().data(chunk.to_json()));
                }
                SinkEvent::Complete(_) => {
                    let chunk = ChunkEnvelope::finish(&id);
                    yield Ok(Event::default().data(chunk.to_json()));
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
                SinkEvent::Error(message) => {
                    yield Ok(Event::default().data(error_json(&message)));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

// ── sink plumbing ────────────────────────────────────────────────────────

enum SinkEvent {
    Token(String),
    Complete(String),
    Error(String),
}

/// Bridges dispatcher callbacks onto a channel the response body drains.
struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl GenerationSink for ChannelSink {
    fn on_token(&self, delta: &str) {
        let _ = self.tx.send(SinkEvent::Token(delta.to_string()));
    }
    fn on_complete(&self, envelope_json: &str) {
        let _ = self.tx.send(SinkEvent::Complete(envelope_json.to_string()));
    }
    fn on_error(&self, message: &str) {
        let _ = self.tx.send(SinkEvent::Error(message.to_string()));
    }
}

// ── streaming chunk shape ────────────────────────────────────────────────

#[derive(Serialize)]
struct ChunkEnvelope {
    id: String,
    object: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Serialize)]
struct ChunkChoice {
    index: u32,
    delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Serialize)]
struct ChunkDelta {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl ChunkEnvelope {
    fn delta(id: &str, content: String) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: "assistant".to_string(),
                    content: Some(content),
                },
                finish_reason: None,
            }],
        }
    }

    fn finish(id: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: "assistant".to_string(),
                    content: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
