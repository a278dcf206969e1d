//! Score-transform pipeline applied to next-token log-probabilities.
//!
//! Processors run in registration order over all beam rows of a step. The
//! default order is fixed and built once from [`GenerationParams`]:
//!
//! 1. Hamming diversity (diverse beam search only)
//! 2. Repetition penalty
//! 3. No-repeat n-gram
//! 4. Encoder no-repeat n-gram
//! 5. Bad words
//! 6. Min length
//! 7. Prefix constraint
//! 8. Forced BOS / forced EOS
//! 9. Inf/NaN removal
//! 10. Exponential length decay
//! 11. Suppress tokens / suppress at begin / forced tokens
//! 12. Caller-supplied processors
//! 13. Logit normalization (always last)

mod ngram;
mod processors;

pub use processors::{
    EncoderNoRepeatNGramProcessor, ExponentialDecayLengthPenalty, ForceTokensProcessor,
    ForcedBosProcessor, ForcedEosProcessor, HammingDiversityProcessor, InfNanRemoveProcessor,
    LogitNormalization, MinLengthProcessor, NoBadWordsProcessor, NoRepeatNGramProcessor,
    PrefixAllowedTokensFn, PrefixConstrainedProcessor, RepetitionPenaltyProcessor,
    SuppressTokensAtBeginProcessor, SuppressTokensProcessor,
};

use crate::config::GenerationParams;
use crate::error::ConfigError;

/// Position of a diversity group within the current step.
#[derive(Debug, Clone, Copy)]
pub struct GroupContext<'a> {
    /// Tokens chosen so far at this step, one per beam row (`batch * num_beams`).
    /// Rows of groups not yet processed hold stale values and must not be read.
    pub current_tokens: &'a [u32],
    pub group_index: usize,
}

/// A rule that rewrites next-token scores given the token history of each row.
pub trait LogitsProcessor: Send + Sync {
    /// `input_ids[i]` is the history of row `i`, `scores[i]` its scores over the vocabulary.
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]);

    /// Group-aware entry point used by diverse beam search.
    fn process_group(
        &self,
        input_ids: &[Vec<u32>],
        scores: &mut [Vec<f32>],
        _group: &GroupContext<'_>,
    ) {
        self.process(input_ids, scores);
    }

    /// Stable tag used to detect duplicate registrations.
    fn name(&self) -> &'static str;
}

/// Ordered chain of logits processors. Immutable once built.
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor to the end of the list.
    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    /// Apply all processors in order.
    pub fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for processor in &self.processors {
            processor.process(input_ids, scores);
        }
    }

    /// Apply all processors in order to the rows of one diversity group.
    pub fn process_group(
        &self,
        input_ids: &[Vec<u32>],
        scores: &mut [Vec<f32>],
        group: &GroupContext<'_>,
    ) {
        for processor in &self.processors {
            processor.process_group(input_ids, scores, group);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Registered tags, in application order.
    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.processors.iter().any(|p| p.name() == name)
    }

    /// Build the default chain from resolved parameters and merge `custom` into it.
    ///
    /// `encoder_input_ids` holds one source sequence per example and feeds the
    /// encoder n-gram rule. A custom processor whose tag matches a default one
    /// is rejected.
    pub fn from_params(
        params: &GenerationParams,
        encoder_input_ids: Option<&[Vec<u32>]>,
        prefix_allowed_tokens_fn: Option<PrefixAllowedTokensFn>,
        custom: Vec<Box<dyn LogitsProcessor>>,
    ) -> Result<Self, ConfigError> {
        let mut list = Self::new();

        if params.diversity_penalty > 0.0 {
            list.push(Box::new(HammingDiversityProcessor::new(
                params.diversity_penalty,
                params.num_beams,
                params.num_beam_groups,
            )));
        }

        if params.repetition_penalty != 1.0 {
            list.push(Box::new(RepetitionPenaltyProcessor::new(
                params.repetition_penalty,
            )));
        }

        if params.no_repeat_ngram_size > 0 {
            list.push(Box::new(NoRepeatNGramProcessor::new(
                params.no_repeat_ngram_size,
            )));
        }

        if params.encoder_no_repeat_ngram_size > 0 {
            let ids = encoder_input_ids.ok_or(ConfigError::MissingEncoderInputIds)?;
            list.push(Box::new(EncoderNoRepeatNGramProcessor::new(
                params.encoder_no_repeat_ngram_size,
                ids.to_vec(),
            )));
        }

        if let Some(ref bad_words_ids) = params.bad_words_ids {
            if !bad_words_ids.is_empty() {
                list.push(Box::new(NoBadWordsProcessor::new(
                    bad_words_ids.clone(),
                    params.eos_token_id,
                )?));
            }
        }

        if params.min_length > 0 {
            list.push(Box::new(MinLengthProcessor::new(
                params.min_length,
                params.eos_token_id,
            )));
        }

        if let Some(allowed) = prefix_allowed_tokens_fn {
            list.push(Box::new(PrefixConstrainedProcessor::new(
                allowed,
                params.group_size(),
            )));
        }

        if let Some(bos) = params.forced_bos_token_id {
            list.push(Box::new(ForcedBosProcessor::new(bos)));
        }

        if let Some(eos) = params.forced_eos_token_id {
            list.push(Box::new(ForcedEosProcessor::new(params.max_length, eos)));
        }

        if params.remove_invalid_values {
            list.push(Box::new(InfNanRemoveProcessor));
        }

        if let Some((start, factor)) = params.exponential_decay_length_penalty {
            list.push(Box::new(ExponentialDecayLengthPenalty::new(
                start,
                factor,
                params.eos_token_id,
                params.input_len,
            )));
        }

        if let Some(ref tokens) = params.suppress_tokens {
            list.push(Box::new(SuppressTokensProcessor::new(tokens.clone())));
        }

        if let Some(ref tokens) = params.begin_suppress_tokens {
            list.push(Box::new(SuppressTokensAtBeginProcessor::new(
                tokens.clone(),
                begin_index(params),
            )));
        }

        if let Some(ref forced) = params.forced_decoder_ids {
            list.push(Box::new(ForceTokensProcessor::new(forced)));
        }

        for processor in custom {
            let name = processor.name();
            if list.contains(name) {
                return Err(ConfigError::DuplicateProcessor { name });
            }
            list.push(processor);
        }

        if params.renormalize_logits {
            list.push(Box::new(LogitNormalization));
        }

        tracing::debug!(processors = ?list.names(), "built logits processor list");
        Ok(list)
    }
}

/// Step at which `begin_suppress_tokens` applies.
fn begin_index(params: &GenerationParams) -> usize {
    let mut begin_index = params.input_len;
    if params.input_len == 1 && params.forced_bos_token_id.is_some() {
        begin_index += 1;
    }
    if let Some((index, _)) = params.forced_decoder_ids.as_ref().and_then(|ids| ids.last()) {
        begin_index += index;
    }
    begin_index
}
