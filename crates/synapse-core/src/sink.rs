/// Streaming sink borrowed by a generation request for its whole duration.
///
/// `on_token` may fire any number of times; exactly one of `on_complete` or
/// `on_error` terminates the stream. Implementations must tolerate delivery
/// failures silently — the engine has no one to tell.
pub trait GenerationSink: Send + Sync {
    /// One incremental text delta, in engine emission order.
    fn on_token(&self, delta: &str);

    /// Terminal success: the full chat-completion envelope as JSON.
    fn on_complete(&self, envelope_json: &str);

    /// Terminal failure.
    fn on_error(&self, message: &str);
}
