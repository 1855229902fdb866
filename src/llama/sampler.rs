//! Sampler chain construction

use llama_cpp_2::sampling::LlamaSampler;
use uuid::Uuid;

use crate::config::SamplingParams;

/// Builds the sampler chain described by `params`.
///
/// Greedy sampling (or a near-zero temperature) short-circuits the chain.
pub fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    if params.greedy || params.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = if params.seed == 0 {
        Uuid::new_v4().as_u128() as u32
    } else {
        params.seed
    };

    let mut chain = Vec::new();
    if params.penalty_last_n != 0 {
        chain.push(LlamaSampler::penalties(
            params.penalty_last_n,
            params.penalty_repeat,
            params.penalty_freq,
            params.penalty_present,
        ));
    }
    if params.top_k > 0 {
        chain.push(LlamaSampler::top_k(params.top_k));
    }
    if params.typical_p < 1.0 {
        chain.push(LlamaSampler::typical(params.typical_p, 1));
    }
    if params.top_p < 1.0 {
        chain.push(LlamaSampler::top_p(params.top_p, 1));
    }
    if params.min_p > 0.0 {
        chain.push(LlamaSampler::min_p(params.min_p, 1));
    }
    chain.push(LlamaSampler::temp(params.temperature));
    chain.push(LlamaSampler::dist(seed));

    tracing::debug!("Sampler chain with {} stages, seed {}", chain.len(), seed);
    LlamaSampler::chain_simple(chain)
}
