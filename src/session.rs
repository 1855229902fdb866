//! Conversational inference session
//!
//! A [`Session`] owns an [`InferenceEngine`] and the [`Conversation`] fed to
//! it. Each call to [`Session::generate`] renders the whole conversation,
//! feeds only the text added since the previous turn, and streams the reply
//! token by token.
//!
//! # Concurrency
//!
//! `generate` holds the session lock from rendering until the cursor is
//! updated, so two calls never interleave. The stop flag lives outside that
//! lock: [`StopHandle::request`] can be called from any thread while a
//! generation is running and is observed once per produced token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use uuid::Uuid;

use crate::conversation::{Conversation, Turn};
use crate::engine::{render, InferenceEngine, TokenId};
use crate::error::SessionError;
use crate::streaming::{StopReason, StreamToken, Utf8Buffer};

/// Shared cancellation flag for one session.
///
/// Cloning is cheap; all clones flip the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running generation to stop. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Summary of a finished generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub reason: StopReason,
    /// Tokens produced from the prompt diff
    pub prompt_tokens: usize,
    /// Tokens sampled and detokenized for the reply
    pub generated_tokens: usize,
}

struct Inner<E> {
    engine: E,
    conversation: Conversation,
    poisoned: Option<String>,
}

/// A stateful chat session over a single engine context.
pub struct Session<E> {
    id: Uuid,
    inner: Mutex<Inner<E>>,
    stop: StopHandle,
}

impl<E: InferenceEngine> Session<E> {
    /// Creates a session with an empty conversation
    pub fn new(engine: E) -> Self {
        Self::with_stop_handle(engine, StopHandle::new())
    }

    /// Creates a session that observes an existing stop handle
    pub fn with_stop_handle(engine: E, stop: StopHandle) -> Self {
        let id = Uuid::new_v4();
        tracing::info!(session = %id, "Session created");
        Self {
            id,
            inner: Mutex::new(Inner {
                engine,
                conversation: Conversation::new(),
                poisoned: None,
            }),
            stop,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops the generation in progress, if any.
    ///
    /// The next call to [`generate`](Self::generate) clears the flag before
    /// starting, so a stale request never cancels a later turn.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Appends `turns_delta` and generates the assistant reply.
    ///
    /// `emit` receives every fragment in order, then exactly one
    /// [`StreamToken::Done`] when the loop ends normally (end of sequence,
    /// context exhausted, or cancelled). On error no `Done` is sent;
    /// fragments already emitted stay valid.
    pub fn generate<F>(
        &self,
        turns_delta: Vec<Turn>,
        mut emit: F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(StreamToken),
    {
        let mut guard = self.lock();
        self.stop.clear();

        let span = tracing::debug_span!("generate", session = %self.id);
        let _enter = span.enter();

        if let Some(reason) = &guard.poisoned {
            return Err(SessionError::Poisoned(reason.clone()));
        }

        guard.conversation.extend(turns_delta);

        let result = guard.run(&self.stop, &mut emit);
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!("Session poisoned: {}", e);
                guard.poisoned = Some(e.to_string());
            } else {
                tracing::warn!("Generation failed: {}", e);
            }
        }
        result
    }

    /// Snapshot of the conversation turns
    pub fn turns(&self) -> Vec<Turn> {
        self.lock().conversation.turns().to_vec()
    }

    /// Length of the rendered template already consumed by the engine
    pub fn cursor(&self) -> usize {
        self.lock().conversation.cursor()
    }

    /// Replaces the stored turns out of band.
    ///
    /// The cursor is kept. If the new history no longer renders with the
    /// consumed text as a prefix, the next `generate` fails with
    /// [`SessionError::StateInconsistency`]; call [`reset`](Self::reset)
    /// to start over.
    pub fn replace_history(&self, turns: Vec<Turn>) {
        self.lock().conversation.replace_turns(turns);
    }

    /// Forgets the conversation and the engine context, and clears poisoning
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.engine.clear_context();
        inner.conversation.clear();
        inner.poisoned = None;
        drop(inner);
        tracing::info!(session = %self.id, "Session reset");
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned.is_some()
    }

    /// Consumes the session and returns its engine
    pub fn into_engine(self) -> E {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .engine
    }

    /// Locks the session state.
    ///
    /// A panic while the lock was held (inside `emit`, say) leaves the
    /// conversation half updated, so the session is marked poisoned until
    /// [`reset`](Self::reset).
    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(e) => {
                let mut guard = e.into_inner();
                guard
                    .poisoned
                    .get_or_insert_with(|| "a previous generation panicked".to_string());
                self.inner.clear_poison();
                guard
            }
        }
    }
}

impl<E: InferenceEngine> Inner<E> {
    fn run(
        &mut self,
        stop: &StopHandle,
        emit: &mut dyn FnMut(StreamToken),
    ) -> Result<GenerationOutcome, SessionError> {
        let started = Instant::now();
        let window = self.engine.context_window();

        let rendered = render(&self.engine, self.conversation.turns(), true, window)?;
        let prompt = self.conversation.prompt_diff(&rendered)?;
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let first_turn = self.engine.used_context_length() == 0;
        let prompt_tokens = self
            .engine
            .tokenize(prompt, first_turn)
            .map_err(SessionError::Tokenize)?;
        if prompt_tokens.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        tracing::debug!(
            "Prompt diff: {} bytes, {} tokens (first turn: {})",
            prompt.len(),
            prompt_tokens.len(),
            first_turn
        );

        let n_prompt = prompt_tokens.len();
        let mut pending: Vec<TokenId> = prompt_tokens;
        let mut response = String::new();
        let mut utf8 = Utf8Buffer::new();
        let mut generated = 0usize;

        let reason = loop {
            if stop.is_requested() {
                tracing::debug!("Generation stopped by request");
                break StopReason::Cancelled;
            }

            // Admission is per batch: the whole batch fits or nothing is decoded
            let used = self.engine.used_context_length();
            if used + pending.len() > window {
                tracing::warn!(
                    "Context size exceeded: {} used + {} pending > {}",
                    used,
                    pending.len(),
                    window
                );
                break StopReason::ContextExceeded;
            }

            self.engine.decode(&pending).map_err(SessionError::Decode)?;

            let token = self.engine.sample();
            if self.engine.is_end_of_sequence(token) {
                tracing::debug!("End of generation token encountered");
                break StopReason::Completed;
            }

            let piece = self
                .engine
                .detokenize(token)
                .map_err(SessionError::Detokenize)?;
            generated += 1;

            if let Some(fragment) = utf8.push(&piece) {
                emit(StreamToken::Token(fragment.clone()));
                response.push_str(&fragment);
            }

            pending.clear();
            pending.push(token);
        };

        if let Some(rest) = utf8.finish() {
            emit(StreamToken::Token(rest.clone()));
            response.push_str(&rest);
        }

        if !response.is_empty() {
            self.conversation.push(Turn::assistant(response));
        }

        let committed = render(&self.engine, self.conversation.turns(), false, window)
            .map_err(|e| match e {
                // The engine already holds this turn; a stale cursor would resend it
                SessionError::Template { message, .. } => SessionError::Template {
                    message,
                    fatal: true,
                },
                other => other,
            })?;
        self.conversation.commit(committed);

        let elapsed = started.elapsed().as_secs_f32();
        tracing::info!(
            "Turn {}: {} prompt tokens, {} generated in {:.2} s ({:.2} t/s)",
            reason,
            n_prompt,
            generated,
            elapsed,
            if elapsed > 0.0 { generated as f32 / elapsed } else { 0.0 }
        );

        emit(StreamToken::Done(reason));

        Ok(GenerationOutcome {
            reason,
            prompt_tokens: n_prompt,
            generated_tokens: generated,
        })
    }
}
