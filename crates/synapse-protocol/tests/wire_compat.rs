// Verify the wire format matches what OpenAI-style clients send and
// expect back. These tests pin the JSON surface so it is never broken
// by refactors.

use synapse_core::types::ContentPart;
use synapse_protocol::wire::{decode_content, encode_part, ChatRequest, CodecError};
use synapse_protocol::ChatCompletion;

#[test]
fn plain_string_content_becomes_one_text_part() {
    let req = ChatRequest::parse(r#"{"messages":[{"role":"user","content":"Hi"}]}"#).unwrap();
    let messages = req.decode_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].parts, vec![ContentPart::text("Hi")]);
}

#[test]
fn empty_messages_array_is_rejected() {
    let err = ChatRequest::parse(r#"{"messages":[]}"#).unwrap_err();
    assert!(matches!(err, CodecError::NoMessages));
}

#[test]
fn sampling_overrides_are_optional() {
    let req = ChatRequest::parse(
        r#"{"model":"m1","messages":[{"role":"user","content":"x"}],"temperature":0.1,"top_k":5}"#,
    )
    .unwrap();
    assert_eq!(req.model.as_deref(), Some("m1"));
    assert_eq!(req.temperature, Some(0.1));
    assert_eq!(req.top_p, None);
    assert_eq!(req.top_k, Some(5));
}

#[test]
fn mixed_part_array_decodes_text_and_media() {
    let json = r#"{"messages":[{"role":"user","content":[
        {"type":"text","text":"what is this?"},
        {"type":"image_url","image_url":{"url":"data:image/png;base64,AQID"}},
        {"type":"audio_url","audio_url":{"url":"data:audio/wav;base64,BAUG"}}
    ]}]}"#;
    let messages = ChatRequest::parse(json).unwrap().decode_messages();
    assert_eq!(
        messages[0].parts,
        vec![
            ContentPart::text("what is this?"),
            ContentPart::Image {
                data: vec![1, 2, 3],
                mime: "image/png".into(),
            },
            ContentPart::Audio {
                data: vec![4, 5, 6],
                mime: "audio/wav".into(),
            },
        ]
    );
}

#[test]
fn malformed_media_parts_are_dropped() {
    let json = r#"{"messages":[{"role":"user","content":[
        {"type":"text","text":"keep me"},
        {"type":"image_url","image_url":{"url":"https://example.com/x.png"}}
    ]}]}"#;
    let messages = ChatRequest::parse(json).unwrap().decode_messages();
    assert_eq!(messages[0].parts, vec![ContentPart::text("keep me")]);
}

#[test]
fn all_parts_dropped_falls_back_to_stringified_content() {
    let content = serde_json::json!([{"type":"tool_call","name":"frobnicate"}]);
    let parts = decode_content(&content);
    assert_eq!(parts.len(), 1);
    match &parts[0] {
        ContentPart::Text { text } => {
            assert!(text.contains("tool_call"));
            assert!(text.contains("frobnicate"));
        }
        other => panic!("expected text fallback, got {other:?}"),
    }
}

#[test]
fn decoded_parts_re_encode_to_canonical_json() {
    let content = serde_json::json!([
        {"type":"text","text":"hello"},
        {"type":"image_url","image_url":{"url":"data:image/jpeg;base64,AQID"}},
    ]);
    let parts = decode_content(&content);
    let round_tripped: Vec<serde_json::Value> = parts.iter().map(encode_part).collect();
    assert_eq!(round_tripped[0], content[0]);
    assert_eq!(round_tripped[1], content[1]);
}

#[test]
fn completion_envelope_shape() {
    let envelope = ChatCompletion::new(Some("m1"), "full reply");
    let json: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();

    assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], "m1");
    assert!(json["created"].as_i64().unwrap() > 0);
    assert_eq!(json["choices"][0]["index"], 0);
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], "full reply");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["usage"]["prompt_tokens"], 0);
    assert_eq!(json["usage"]["completion_tokens"], 0);
    assert_eq!(json["usage"]["total_tokens"], 0);
}

#[test]
fn missing_model_falls_back_to_default_name() {
    let envelope = ChatCompletion::new(None, "x");
    assert_eq!(envelope.model, "litertlm-model");
}
