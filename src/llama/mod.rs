//! llama.cpp engine adapter
//!
//! [`LlamaEngine`] implements [`InferenceEngine`](crate::engine::InferenceEngine)
//! on top of llama-cpp-2, and [`LlamaChat`] runs a [`Session`](crate::session::Session)
//! over it on a dedicated worker thread.

mod engine;
mod sampler;
mod worker;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::SessionError;

pub use engine::LlamaEngine;
pub use sampler::build_sampler;
pub use worker::{LlamaChat, LoadedModelInfo};

/// Errors that can occur while starting or talking to a llama.cpp session
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Invalid parameters: {0}")]
    Config(String),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Failed to load chat template: {0}")]
    ChatTemplate(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}
