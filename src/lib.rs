//! llm-session
//!
//! Stateful chat sessions over an autoregressive inference engine. A session
//! renders the conversation through the model's chat template, feeds only the
//! newly added text to the engine, and streams the reply token by token.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
#[cfg(feature = "llama")]
pub mod llama;
pub mod session;
pub mod streaming;

#[cfg(test)]
mod testing;

pub use conversation::{Conversation, Turn};
pub use engine::{EngineFault, InferenceEngine, Rendered, TokenId};
pub use error::SessionError;
pub use session::{GenerationOutcome, Session, StopHandle};
pub use streaming::{StopReason, StreamToken};
