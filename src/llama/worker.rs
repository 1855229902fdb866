//! Worker-thread session handle
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, the session and its engine live on a
//! dedicated worker thread. The caller communicates via channels; commands
//! are handled one at a time, in the order they were sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use super::{EngineError, LlamaEngine};
use crate::config::SessionParams;
use crate::conversation::Turn;
use crate::engine::InferenceEngine;
use crate::session::{Session, StopHandle};
use crate::streaming::{StopReason, StreamToken};

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Context length the model was trained with
    pub train_context: u32,
    /// Context window of the session
    pub context_window: usize,
    /// Total parameter count
    pub param_count: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Prompt {
        turns: Vec<Turn>,
        token_tx: Sender<StreamToken>,
    },
    Reset,
    History {
        response_tx: Sender<Vec<Turn>>,
    },
    Shutdown,
}

/// A chat session on a llama.cpp model, driven from any thread.
pub struct LlamaChat {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Shared with the session on the worker thread
    stop: StopHandle,
    /// Set once the handle is dropped; the worker skips queued prompts
    shutdown: Arc<AtomicBool>,
    model_info: LoadedModelInfo,
}

impl LlamaChat {
    /// Loads the model and starts the worker thread.
    ///
    /// Returns once the model is loaded and the context is ready, or with
    /// the error that prevented it.
    pub fn start(params: SessionParams) -> Result<Self, EngineError> {
        params.require_model_path()?;

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = StopHandle::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_stop = stop.clone();
        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("llm-session".to_string())
            .spawn(move || {
                worker_thread_main(params, worker_stop, worker_shutdown, ready_tx, command_rx)
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(e) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError(e.to_string()));
            }
        };

        tracing::info!("LlamaChat worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            stop,
            shutdown,
            model_info,
        })
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.model_info
    }

    /// Submits new turns and returns the stream of the reply.
    ///
    /// The receiver yields fragments followed by either
    /// [`StreamToken::Done`] or [`StreamToken::Error`]. Dropping it stops
    /// the generation.
    pub fn prompt(&self, turns: Vec<Turn>) -> Result<Receiver<StreamToken>, EngineError> {
        let (token_tx, token_rx) = mpsc::channel();
        self.send(WorkerCommand::Prompt { turns, token_tx })?;
        Ok(token_rx)
    }

    /// Requests the running generation to stop
    pub fn stop(&self) {
        self.stop.request();
    }

    /// Forgets the conversation and clears the model context
    pub fn reset(&self) -> Result<(), EngineError> {
        self.send(WorkerCommand::Reset)
    }

    /// Returns the conversation turns recorded so far
    pub fn history(&self) -> Result<Vec<Turn>, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::History { response_tx })?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("worker is shut down".to_string()))?
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }
}

impl Drop for LlamaChat {
    fn drop(&mut self) {
        // Queued prompts are answered without generating; an in-flight one
        // ends at its next token
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop.request();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the backend, model and session, processes commands from the handle.
fn worker_thread_main(
    params: SessionParams,
    stop: StopHandle,
    shutdown: Arc<AtomicBool>,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    send_logs_to_tracing(LogOptions::default().with_logs_enabled(params.engine_logs));

    let backend = match LlamaBackend::init() {
        Ok(b) => b,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
            return;
        }
    };

    let model = match load_model(&backend, &params) {
        Ok(m) => m,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let engine = match LlamaEngine::new(&backend, &model, &params) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let info = LoadedModelInfo {
        path: params
            .model_path
            .as_deref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        vocab_size: model.n_vocab(),
        train_context: model.n_ctx_train(),
        context_window: engine.context_window(),
        param_count: model.n_params() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_window
    );
    if info.context_window > info.train_context as usize {
        tracing::warn!(
            "Context window {} exceeds the {} tokens the model was trained on",
            info.context_window,
            info.train_context
        );
    }

    let session = Session::with_stop_handle(engine, stop);
    if ready_tx.send(Ok(info)).is_err() {
        return;
    }

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Prompt { turns, token_tx }) => {
                handle_prompt(&session, &shutdown, turns, &token_tx);
            }
            Ok(WorkerCommand::Reset) => session.reset(),
            Ok(WorkerCommand::History { response_tx }) => {
                let _ = response_tx.send(session.turns());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Runs one prompt command, streaming its reply into `token_tx`
fn handle_prompt<E: InferenceEngine>(
    session: &Session<E>,
    shutdown: &AtomicBool,
    turns: Vec<Turn>,
    token_tx: &Sender<StreamToken>,
) {
    if shutdown.load(Ordering::SeqCst) {
        tracing::debug!("Skipping queued prompt, worker is shutting down");
        let _ = token_tx.send(StreamToken::Done(StopReason::Cancelled));
        return;
    }

    let stop = session.stop_handle();
    let result = session.generate(turns, |token| {
        // generate() clears the stop flag on entry, so shutdown is re-checked here
        if token_tx.send(token).is_err() || shutdown.load(Ordering::SeqCst) {
            stop.request();
        }
    });
    if let Err(e) = result {
        let _ = token_tx.send(StreamToken::Error(e));
    }
}

fn load_model(backend: &LlamaBackend, params: &SessionParams) -> Result<LlamaModel, EngineError> {
    let path = params.require_model_path()?;
    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(params.model.n_gpu_layers)
        .with_use_mlock(params.model.use_mlock);

    LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use std::time::Duration;

    #[test]
    fn test_queued_prompt_is_skipped_after_shutdown() {
        let engine = ScriptedEngine::new(512).endless('x');
        let session = Session::new(engine.clone());
        let shutdown = AtomicBool::new(true);

        let (token_tx, token_rx) = mpsc::channel();
        handle_prompt(&session, &shutdown, vec![Turn::user("Hello")], &token_tx);
        drop(token_tx);

        let stream: Vec<StreamToken> = token_rx.iter().collect();
        assert_eq!(stream, vec![StreamToken::Done(StopReason::Cancelled)]);
        assert!(engine.log().decoded.is_empty());
        assert!(session.turns().is_empty());
    }

    #[test]
    fn test_shutdown_stops_running_prompt() {
        let engine = ScriptedEngine::new(100_000)
            .endless('x')
            .with_decode_delay(Duration::from_millis(1));
        let session = Session::new(engine);
        let shutdown = AtomicBool::new(false);
        let (token_tx, token_rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(|| handle_prompt(&session, &shutdown, vec![Turn::user("Hello")], &token_tx));

            let first = token_rx.recv().unwrap();
            assert!(first.is_token());
            shutdown.store(true, Ordering::SeqCst);
        });
        drop(token_tx);

        let rest: Vec<StreamToken> = token_rx.iter().collect();
        assert_eq!(rest.last(), Some(&StreamToken::Done(StopReason::Cancelled)));
        assert!(rest.len() < 100);
    }
}
