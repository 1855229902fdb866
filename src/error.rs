//! Session error types

use thiserror::Error;

use crate::engine::EngineFault;

/// Errors returned by [`Session::generate`](crate::session::Session::generate).
///
/// Normal terminal conditions (end of sequence, context exhausted,
/// cancellation) are not errors; they are reported as a
/// [`StopReason`](crate::streaming::StopReason).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Failed to apply the chat template: {message}")]
    Template {
        message: String,
        /// Set when the engine context already advanced past the cursor
        fatal: bool,
    },

    #[error("Failed to tokenize the prompt: {0}")]
    Tokenize(EngineFault),

    #[error("Failed to decode: {0}")]
    Decode(EngineFault),

    #[error("Failed to convert token to piece: {0}")]
    Detokenize(EngineFault),

    #[error(
        "Conversation diverged from the consumed prompt (cursor {cursor}, rendered length {rendered_len})"
    )]
    StateInconsistency { cursor: usize, rendered_len: usize },

    #[error("Prompt diff is empty, nothing to feed the engine")]
    EmptyPrompt,

    #[error("Session is poisoned by an earlier failure: {0}")]
    Poisoned(String),
}

impl SessionError {
    pub(crate) fn template(message: impl Into<String>) -> Self {
        SessionError::Template {
            message: message.into(),
            fatal: false,
        }
    }

    /// Returns true if the engine state can no longer be trusted.
    ///
    /// A fatal error poisons the session until it is reset.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Template { fatal, .. } => *fatal,
            SessionError::Tokenize(_)
            | SessionError::Decode(_)
            | SessionError::Detokenize(_)
            | SessionError::Poisoned(_) => true,
            SessionError::StateInconsistency { .. } | SessionError::EmptyPrompt => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::Decode(EngineFault::new("boom")).is_fatal());
        assert!(SessionError::Tokenize(EngineFault::new("boom")).is_fatal());
        assert!(SessionError::Detokenize(EngineFault::new("boom")).is_fatal());
        assert!(!SessionError::template("bad").is_fatal());
        assert!(SessionError::Template {
            message: "bad".to_string(),
            fatal: true
        }
        .is_fatal());
        assert!(!SessionError::EmptyPrompt.is_fatal());
        assert!(!SessionError::StateInconsistency {
            cursor: 1,
            rendered_len: 0
        }
        .is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::Decode(EngineFault::new("n_tokens == 0"));
        assert_eq!(err.to_string(), "Failed to decode: n_tokens == 0");
    }
}
