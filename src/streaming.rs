//! Streaming output
//!
//! Values handed to the caller while a turn is generated, and the UTF-8
//! reassembly of token pieces into text fragments.

use std::fmt;

use crate::error::SessionError;

/// Why a generation loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model sampled an end-of-sequence token
    Completed,
    /// The next batch would not fit in the context window
    ContextExceeded,
    /// A stop was requested while generating
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Completed => "completed",
            StopReason::ContextExceeded => "context exceeded",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Represents a value emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// End of stream; always the last value of a finished generation
    Done(StopReason),
    /// Generation failed; only sent by channel-based handles
    Error(SessionError),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if this marks the end of the stream
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the fragment if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            StreamToken::Done(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Buffers token bytes until they form complete UTF-8 text.
///
/// A multi-byte character can be split across tokens; the trailing
/// incomplete sequence is held back until the next piece arrives.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token's bytes and return any text that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut ready = 0;
        while ready < self.pending.len() {
            match std::str::from_utf8(&self.pending[ready..]) {
                Ok(_) => ready = self.pending.len(),
                // Invalid bytes will never complete; skip past them and keep scanning
                Err(e) => match e.error_len() {
                    Some(invalid) => ready += e.valid_up_to() + invalid,
                    // Only an incomplete tail; keep it for the next piece
                    None => {
                        ready += e.valid_up_to();
                        break;
                    }
                },
            }
        }

        let fragment: Vec<u8> = self.pending.drain(..ready).collect();
        non_empty(String::from_utf8_lossy(&fragment).into_owned())
    }

    /// Flush whatever is left, replacing incomplete sequences
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        non_empty(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
