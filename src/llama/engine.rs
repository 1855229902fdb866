//! llama.cpp implementation of the engine boundary

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::sampler::build_sampler;
use super::EngineError;
use crate::config::SessionParams;
use crate::conversation::Turn;
use crate::engine::{EngineFault, InferenceEngine, Rendered, TokenId};

/// A llama.cpp context bound to a loaded model.
///
/// The context is kept across turns, so its KV cache holds the whole
/// conversation and each turn only decodes new tokens.
pub struct LlamaEngine<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    template: LlamaChatTemplate,
    batch: LlamaBatch,
    n_batch: usize,
    /// Positions decoded so far
    n_past: i32,
    /// Batch index holding the logits to sample from
    logits_index: i32,
}

impl<'m> LlamaEngine<'m> {
    /// Creates a context and sampler chain for `model`
    pub fn new(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        params: &SessionParams,
    ) -> Result<Self, EngineError> {
        let context = &params.context;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(context.n_ctx))
            .with_n_batch(context.n_batch)
            .with_n_ubatch(context.n_ubatch);
        if let Some(threads) = context.n_threads {
            ctx_params = ctx_params.with_n_threads(threads);
        }
        if let Some(threads) = context.n_threads_batch {
            ctx_params = ctx_params.with_n_threads_batch(threads);
        }

        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        let template = model
            .chat_template(None)
            .map_err(|e| EngineError::ChatTemplate(e.to_string()))?;

        let n_batch = context.n_batch.max(1) as usize;
        tracing::debug!("Created context: n_ctx = {}, n_batch = {}", ctx.n_ctx(), n_batch);

        Ok(Self {
            model,
            ctx,
            sampler: build_sampler(&params.sampling),
            template,
            batch: LlamaBatch::new(n_batch, 1),
            n_batch,
            n_past: 0,
            logits_index: 0,
        })
    }
}

fn fault(e: impl std::fmt::Display) -> EngineFault {
    EngineFault::new(e.to_string())
}

impl InferenceEngine for LlamaEngine<'_> {
    fn render_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<Rendered, EngineFault> {
        let chat = turns
            .iter()
            .map(|t| LlamaChatMessage::new(t.role().to_string(), t.content().to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(fault)?;

        let text = self
            .model
            .apply_chat_template(&self.template, &chat, add_generation_prompt)
            .map_err(fault)?;

        if text.len() > buf.len() {
            return Ok(Rendered::NeedsCapacity(text.len()));
        }
        buf[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Rendered::Complete(text.len()))
    }

    fn context_window(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn used_context_length(&self) -> usize {
        self.n_past as usize
    }

    fn tokenize(&self, text: &str, first_turn: bool) -> Result<Vec<TokenId>, EngineFault> {
        let add_bos = if first_turn {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self.model.str_to_token(text, add_bos).map_err(fault)?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), EngineFault> {
        if tokens.is_empty() {
            return Err(EngineFault::new("cannot decode an empty batch"));
        }

        // A prompt diff may be longer than one batch; only the final token needs logits
        let last = tokens.len() - 1;
        for (chunk_index, chunk) in tokens.chunks(self.n_batch).enumerate() {
            let offset = chunk_index * self.n_batch;
            self.batch.clear();
            for (i, &id) in chunk.iter().enumerate() {
                let pos = self.n_past + i as i32;
                self.batch
                    .add(LlamaToken::new(id), pos, &[0], offset + i == last)
                    .map_err(fault)?;
            }

            self.ctx.decode(&mut self.batch).map_err(fault)?;
            self.n_past += chunk.len() as i32;
        }

        self.logits_index = self.batch.n_tokens() - 1;
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        self.sampler.sample(&self.ctx, self.logits_index).0
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineFault> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(fault)
    }

    fn clear_context(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
        self.logits_index = 0;
    }
}
