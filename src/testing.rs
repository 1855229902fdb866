//! Deterministic engine used by the unit tests.
//!
//! Template: every turn renders as `<|role|>content<|end|>`, and the
//! generation prompt is `<|assistant|>`. Every char is one token.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::conversation::Turn;
use crate::engine::{EngineFault, InferenceEngine, Rendered, TokenId};

pub const BOS: TokenId = 0x11_0000;
pub const EOS: TokenId = 0x11_0001;
const RAW_BYTE_BASE: TokenId = 0x20_0000;

/// Token that detokenizes to a single raw byte
pub fn raw_byte(b: u8) -> TokenId {
    RAW_BYTE_BASE + TokenId::from(b)
}

pub fn char_tokens(text: &str) -> Vec<TokenId> {
    text.chars().map(|c| c as TokenId).collect()
}

pub fn render_turns(turns: &[Turn], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str(&format!("<|{}|>{}<|end|>", turn.role(), turn.content()));
    }
    if add_generation_prompt {
        out.push_str("<|assistant|>");
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub render_generation: bool,
    pub render_commit: bool,
    pub tokenize: bool,
    /// Fail the n-th decode call (0-based)
    pub decode_call: Option<usize>,
    pub detokenize: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EngineLog {
    pub render_calls: usize,
    pub tokenized: Vec<(String, bool)>,
    pub decoded: Vec<Vec<TokenId>>,
    pub used: usize,
    pub clears: usize,
}

#[derive(Debug, Default)]
struct State {
    log: EngineLog,
    faults: Faults,
    current: VecDeque<TokenId>,
    queued: VecDeque<Vec<TokenId>>,
    endless: Option<TokenId>,
    decode_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    window: usize,
    state: Arc<Mutex<State>>,
}

impl ScriptedEngine {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// One reply per generation, in order
    pub fn with_replies(self, replies: &[&str]) -> Self {
        let tokens = replies.iter().map(|r| char_tokens(r)).collect();
        self.with_token_replies(tokens)
    }

    pub fn with_token_replies(self, replies: Vec<Vec<TokenId>>) -> Self {
        {
            let mut state = self.state();
            state.queued = replies.into();
            let first = state.queued.pop_front().unwrap_or_default();
            state.current = first.into();
        }
        self
    }

    /// Never sample end-of-sequence; keep producing `c`
    pub fn endless(self, c: char) -> Self {
        self.state().endless = Some(c as TokenId);
        self
    }

    pub fn with_decode_delay(self, delay: Duration) -> Self {
        self.state().decode_delay = Some(delay);
        self
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    pub fn fail_all_renders(&self) {
        let mut state = self.state();
        state.faults.render_generation = true;
        state.faults.render_commit = true;
    }

    pub fn log(&self) -> EngineLog {
        self.state().log.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn render_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<Rendered, EngineFault> {
        let mut state = self.state();
        state.log.render_calls += 1;

        let failing = if add_generation_prompt {
            state.faults.render_generation
        } else {
            state.faults.render_commit
        };
        if failing {
            return Err(EngineFault::new("template rendering failed"));
        }

        let text = render_turns(turns, add_generation_prompt);
        if text.len() > buf.len() {
            return Ok(Rendered::NeedsCapacity(text.len()));
        }
        buf[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Rendered::Complete(text.len()))
    }

    fn context_window(&self) -> usize {
        self.window
    }

    fn used_context_length(&self) -> usize {
        self.state().log.used
    }

    fn tokenize(&self, text: &str, first_turn: bool) -> Result<Vec<TokenId>, EngineFault> {
        let mut state = self.state();
        state.log.tokenized.push((text.to_string(), first_turn));
        if state.faults.tokenize {
            return Err(EngineFault::new("required length changed between calls"));
        }

        let mut tokens = Vec::with_capacity(text.len() + 1);
        if first_turn {
            tokens.push(BOS);
        }
        tokens.extend(char_tokens(text));
        Ok(tokens)
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), EngineFault> {
        let delay = {
            let mut state = self.state();
            let call = state.log.decoded.len();
            state.log.decoded.push(tokens.to_vec());
            if state.faults.decode_call == Some(call) {
                return Err(EngineFault::new("llama_decode returned -1"));
            }
            state.log.used += tokens.len();
            state.decode_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        let mut state = self.state();
        if let Some(token) = state.endless {
            return token;
        }
        match state.current.pop_front() {
            Some(token) => token,
            None => {
                let next = state.queued.pop_front().unwrap_or_default();
                state.current = next.into();
                EOS
            }
        }
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineFault> {
        if self.state().faults.detokenize {
            return Err(EngineFault::new("piece buffer too small"));
        }
        if token == BOS || token == EOS {
            return Ok(Vec::new());
        }
        if token >= RAW_BYTE_BASE {
            return Ok(vec![(token - RAW_BYTE_BASE) as u8]);
        }
        let c = char::from_u32(token as u32)
            .ok_or_else(|| EngineFault::new(format!("unknown token {token}")))?;
        Ok(c.to_string().into_bytes())
    }

    fn clear_context(&mut self) {
        let mut state = self.state();
        state.log.used = 0;
        state.log.clears += 1;
    }
}
