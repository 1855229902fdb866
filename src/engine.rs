//! Inference engine boundary
//!
//! The session drives an opaque engine that owns the model, its fixed-size
//! context window and a configured sampler chain. This module defines the
//! operations the session consumes; the llama.cpp implementation lives in
//! [`crate::llama`].

use std::fmt;

use crate::conversation::Turn;
use crate::error::SessionError;

/// Opaque token id as produced by the engine's tokenizer
pub type TokenId = i32;

/// Result of rendering the chat template into a caller-provided buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendered {
    /// The buffer held the full rendering; this many bytes were written
    Complete(usize),
    /// The buffer was too small; this many bytes are required
    NeedsCapacity(usize),
}

/// Failure reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFault(String);

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EngineFault {}

/// Operations the session needs from a loaded model and its context.
///
/// Implementations keep their own incremental state (KV cache): every
/// `decode` call extends the context, and `sample` reads the logits of the
/// last decoded position.
pub trait InferenceEngine {
    /// Render `turns` through the model's chat template into `buf`.
    ///
    /// When `add_generation_prompt` is set, the assistant prefix is appended
    /// so the model continues as the assistant.
    fn render_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<Rendered, EngineFault>;

    /// Size of the context window in tokens
    fn context_window(&self) -> usize;

    /// Number of context slots currently occupied
    fn used_context_length(&self) -> usize;

    /// Tokenize `text`. `first_turn` requests a beginning-of-sequence marker.
    fn tokenize(&self, text: &str, first_turn: bool) -> Result<Vec<TokenId>, EngineFault>;

    /// Feed `tokens` to the model, extending its context
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), EngineFault>;

    /// Sample the next token from the last decoded position
    fn sample(&mut self) -> TokenId;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Raw bytes of a single token; may be an incomplete UTF-8 sequence
    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineFault>;

    /// Forget all decoded context
    fn clear_context(&mut self);
}

/// Render the template, growing the buffer once if the engine asks for more.
pub(crate) fn render<E: InferenceEngine + ?Sized>(
    engine: &E,
    turns: &[Turn],
    add_generation_prompt: bool,
    initial_capacity: usize,
) -> Result<String, SessionError> {
    let mut buf = vec![0u8; initial_capacity];

    let mut rendered = engine
        .render_template(turns, add_generation_prompt, &mut buf)
        .map_err(|e| SessionError::template(e.message()))?;

    if let Rendered::NeedsCapacity(required) = rendered {
        tracing::debug!("Growing template buffer from {} to {} bytes", buf.len(), required);
        buf.resize(required, 0);
        rendered = engine
            .render_template(turns, add_generation_prompt, &mut buf)
            .map_err(|e| SessionError::template(e.message()))?;
    }

    match rendered {
        Rendered::Complete(len) if len <= buf.len() => {
            buf.truncate(len);
            String::from_utf8(buf)
                .map_err(|e| SessionError::template(format!("rendered text is not UTF-8: {e}")))
        }
        Rendered::Complete(len) => Err(SessionError::template(format!(
            "engine reported {len} bytes for a {} byte buffer",
            buf.len()
        ))),
        Rendered::NeedsCapacity(required) => Err(SessionError::template(format!(
            "buffer still too small after growing to {} bytes (needs {required})",
            buf.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn test_render_fits_initial_buffer() {
        let engine = ScriptedEngine::new(64);
        let text = render(&engine, &[Turn::user("Hello")], true, 256).unwrap();
        assert_eq!(text, "<|user|>Hello<|end|><|assistant|>");
        assert_eq!(engine.log().render_calls, 1);
    }

    #[test]
    fn test_render_grows_buffer_once() {
        let engine = ScriptedEngine::new(64);
        let text = render(&engine, &[Turn::user("Hello")], false, 4).unwrap();
        assert_eq!(text, "<|user|>Hello<|end|>");
        assert_eq!(engine.log().render_calls, 2);
    }

    #[test]
    fn test_render_failure_is_template_error() {
        let engine = ScriptedEngine::new(64);
        engine.fail_all_renders();
        let result = render(&engine, &[Turn::user("Hello")], true, 256);
        assert!(matches!(result, Err(SessionError::Template { fatal: false, .. })));
    }
}
