//! Session parameters
//!
//! Model, context and sampling parameters used to build an engine, with
//! defaults, range validation and JSON persistence.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing 'model_path' in parameters")]
    MissingModelPath,
}

/// Model loading parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub n_gpu_layers: u32,
    /// Lock the model weights in RAM so they are never swapped out
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            // Offload all layers by default
            n_gpu_layers: 99,
            use_mlock: false,
        }
    }
}

/// Context window parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context window size in tokens
    pub n_ctx: u32,
    /// Maximum tokens per decode call
    pub n_batch: u32,
    /// Physical micro-batch size
    pub n_ubatch: u32,
    /// Threads used for generation (None = all available)
    pub n_threads: Option<i32>,
    /// Threads used for prompt processing (None = all available)
    pub n_threads_batch: Option<i32>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: None,
            n_threads_batch: None,
        }
    }
}

/// Sampler chain parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Always pick the most likely token; the other fields are ignored
    pub greedy: bool,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: i32,
    /// Top-p (nucleus) sampling parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Min-p sampling parameter (0.0 = disabled)
    pub min_p: f32,
    /// Locally typical sampling parameter (1.0 = disabled)
    pub typical_p: f32,
    /// Number of recent tokens considered by the penalties (0 = disabled)
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            greedy: true,
            seed: 0,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
        }
    }
}

/// Everything needed to start a session on a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Path to the GGUF model file
    pub model_path: Option<PathBuf>,
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampling: SamplingParams,
    /// Route the engine's own log output into tracing
    pub engine_logs: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model_path: None,
            model: ModelParams::default(),
            context: ContextParams::default(),
            sampling: SamplingParams::default(),
            engine_logs: false,
        }
    }
}

impl SessionParams {
    /// Default parameters serialized as JSON, suitable as a template for callers
    pub fn default_json() -> String {
        Self::default().to_json()
    }

    /// Parse parameters from JSON; absent keys take their default value
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut params: SessionParams = serde_json::from_str(json)?;
        params.validate();
        Ok(params)
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// The configured model file, required before an engine can start
    pub fn require_model_path(&self) -> Result<&Path, ConfigError> {
        self.model_path
            .as_deref()
            .ok_or(ConfigError::MissingModelPath)
    }

    /// Validate parameter values
    ///
    /// Clamps sampling values into their ranges and restores defaults for
    /// sizes that must not be zero.
    pub fn validate(&mut self) {
        let sampling = &mut self.sampling;
        sampling.temperature = sampling.temperature.clamp(0.0, 2.0);
        sampling.top_p = sampling.top_p.clamp(0.0, 1.0);
        sampling.min_p = sampling.min_p.clamp(0.0, 1.0);
        sampling.typical_p = sampling.typical_p.clamp(0.0, 1.0);
        sampling.top_k = sampling.top_k.max(0);
        sampling.penalty_last_n = sampling.penalty_last_n.max(-1);

        let context = &mut self.context;
        if context.n_ctx == 0 {
            context.n_ctx = ContextParams::default().n_ctx;
        }
        if context.n_batch == 0 {
            context.n_batch = ContextParams::default().n_batch;
        }
        if context.n_ubatch == 0 || context.n_ubatch > context.n_batch {
            context.n_ubatch = context.n_batch;
        }
        for threads in [&mut context.n_threads, &mut context.n_threads_batch] {
            if threads.is_some_and(|n| n <= 0) {
                *threads = None;
            }
        }
    }
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "LlmSession", "llm-session")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDirError("Could not determine data directory".to_string()))
}

/// Get the parameters file path
fn get_params_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("params.json"))
}

/// Load parameters from the data directory
///
/// Returns defaults if the file doesn't exist or is corrupted
pub fn load_params() -> SessionParams {
    let loaded = get_params_path().and_then(|path| {
        if path.exists() {
            load_params_from(&path)
        } else {
            tracing::info!("Parameters file not found, using defaults");
            Ok(SessionParams::default())
        }
    });

    match loaded {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("Failed to load parameters, using defaults: {}", e);
            SessionParams::default()
        }
    }
}

/// Save parameters to the data directory
pub fn save_params(params: &SessionParams) -> Result<(), ConfigError> {
    save_params_to(get_params_path()?, params)
}

/// Load and validate parameters from an explicit file
pub fn load_params_from<P: AsRef<Path>>(path: P) -> Result<SessionParams, ConfigError> {
    let json = fs::read_to_string(path.as_ref())?;
    let params = SessionParams::from_json(&json)?;
    tracing::debug!("Loaded parameters from {}", path.as_ref().display());
    Ok(params)
}

/// Save parameters to an explicit file, creating its parent directory
pub fn save_params_to<P: AsRef<Path>>(path: P, params: &SessionParams) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(params)?;
    fs::write(path, json)?;

    tracing::debug!("Saved parameters to {}", path.display());
    Ok(())
}
