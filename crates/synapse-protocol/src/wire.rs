use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use synapse_core::types::{ContentPart, Message, Role};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no messages provided")]
    NoMessages,
}

/// On-wire generate request.
///
/// `messages` carries only this turn's new messages, not the full history.
/// Sampling fields, when present, update the conversation before the turn.
/// `model` is echoed in the reply envelope and otherwise ignored. Unknown
/// fields are tolerated.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

/// A wire message: `content` is either a plain string or an array of
/// typed content parts.
#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: Value,
}

impl ChatRequest {
    /// Parse a request body; an empty `messages` array is rejected here so
    /// callers get one uniform error.
    pub fn parse(json: &str) -> Result<Self, CodecError> {
        let req: ChatRequest = serde_json::from_str(json)?;
        if req.messages.is_empty() {
            return Err(CodecError::NoMessages);
        }
        Ok(req)
    }

    /// Decode every wire message into the internal representation.
    pub fn decode_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .map(|m| Message::new(m.role, decode_content(&m.content)))
            .collect()
    }
}

/// Translate wire content into typed parts.
///
/// A plain string becomes a single text part. Array elements that fail to
/// decode (unknown type, malformed data URL) are dropped with a log entry;
/// when nothing survives, the stringified content is used as a single text
/// part so the engine still receives something.
pub fn decode_content(content: &Value) -> Vec<ContentPart> {
    match content {
        Value::String(s) => vec![ContentPart::text(s.clone())],
        Value::Array(items) => {
            let parts: Vec<ContentPart> = items
                .iter()
                .filter_map(|item| {
                    let part = decode_part(item);
                    if part.is_none() {
                        warn!(part = %item, "dropping undecodable content part");
                    }
                    part
                })
                .collect();
            if parts.is_empty() {
                vec![ContentPart::text(content.to_string())]
            } else {
                parts
            }
        }
        other => vec![ContentPart::text(other.to_string())],
    }
}

fn decode_part(item: &Value) -> Option<ContentPart> {
    match item.get("type")?.as_str()? {
        "text" => Some(ContentPart::text(item.get("text")?.as_str()?)),
        "image_url" => {
            let url = item.get("image_url")?.get("url")?.as_str()?;
            let (data, mime) = parse_data_url(url, "image")?;
            Some(ContentPart::Image { data, mime })
        }
        "audio_url" => {
            let url = item.get("audio_url")?.get("url")?.as_str()?;
            let (data, mime) = parse_data_url(url, "audio")?;
            Some(ContentPart::Audio { data, mime })
        }
        _ => None,
    }
}

/// Accepts only RFC-2397 base64 data URLs: `data:<mime>;base64,<payload>`,
/// with the MIME type constrained to the expected top-level kind.
fn parse_data_url(url: &str, kind: &str) -> Option<(Vec<u8>, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    if !mime.starts_with(kind) || !mime[kind.len()..].starts_with('/') {
        return None;
    }
    let data = STANDARD.decode(payload).ok()?;
    Some((data, mime.to_string()))
}

/// Canonical wire encoding of one content part — the inverse of
/// [`decode_content`].
pub fn encode_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentPart::Image { data, mime } => serde_json::json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", mime, STANDARD.encode(data)) },
        }),
        ContentPart::Audio { data, mime } => serde_json::json!({
            "type": "audio_url",
            "audio_url": { "url": format!("data:{};base64,{}", mime, STANDARD.encode(data)) },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_requires_base64_marker() {
        assert!(parse_data_url("data:image/png,plain", "image").is_none());
        assert!(parse_data_url("https://example.com/a.png", "image").is_none());
        assert!(parse_data_url("data:audio/wav;base64,AAAA", "image").is_none());
        // "imagery/png" must not pass the "image" kind check
        assert!(parse_data_url("data:imagery/png;base64,AAAA", "image").is_none());

        let (data, mime) = parse_data_url("data:image/png;base64,AQID", "image").unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn invalid_base64_payload_is_rejected() {
        assert!(parse_data_url("data:image/png;base64,!!!", "image").is_none());
    }
}
