use serde::{Deserialize, Serialize};

/// Author of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
            Role::System => f.write_str("system"),
        }
    }
}

/// One piece of multimodal message content.
///
/// Binary payloads are serialized as base64 strings so conversation history
/// survives the JSON round-trip to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(with = "b64_bytes")]
        data: Vec<u8>,
        mime: String,
    },
    Audio {
        #[serde(with = "b64_bytes")]
        data: Vec<u8>,
        mime: String,
    },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }
}

/// A single message: an ordered, non-empty sequence of content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    /// Convenience constructor for a plain-text user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::text(text)],
        }
    }

    /// Convenience constructor for a plain-text assistant message.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text of all `Text` parts. Media parts contribute nothing.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Decoding parameters for a generation turn.
///
/// Equality drives the engine-session reuse check: a turn with different
/// sampling than the active binding forces a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
        }
    }
}

/// Serde adapter: `Vec<u8>` <-> base64 string.
mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_skips_media_parts() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentPart::text("look at "),
                ContentPart::Image {
                    data: vec![1, 2, 3],
                    mime: "image/png".into(),
                },
                ContentPart::text("this"),
            ],
        );
        assert_eq!(msg.text(), "look at this");
    }

    #[test]
    fn content_part_json_round_trip() {
        let part = ContentPart::Image {
            data: vec![0xde, 0xad, 0xbe, 0xef],
            mime: "image/jpeg".into(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains(r#""type":"image""#));
        assert!(json.contains(r#""mime":"image/jpeg""#));
        let back: ContentPart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn sampling_defaults() {
        let s = SamplingParams::default();
        assert_eq!(s.temperature, 0.8);
        assert_eq!(s.top_p, 0.95);
        assert_eq!(s.top_k, 40);
    }
}
