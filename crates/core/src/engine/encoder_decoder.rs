//! Scoring-model trait for multimodal sequence-to-sequence generation.
//!
//! The model has two distinct phases:
//! 1. **Encode**: process the multimodal source (text, image regions,
//!    knowledge-graph entities) once per call
//! 2. **Decode**: score the next token of every beam row, attending to the
//!    encoder output through cross-attention
//!
//! The encoder output is computed once and reused for every decoder step.
//!
//! # Example
//!
//! ```ignore
//! use mmgen_core::engine::{EncoderOutput, Seq2SeqScorer};
//!
//! // Phase 1: Encode source once
//! let encoder_output = model.encode(&inputs)?;
//!
//! // Phase 2: Decode autoregressively
//! let step = model.decode_step(&decoder_ids, &encoder_output, cache.as_ref())?;
//! ```

use candle_core::{DType, Device, Result, Tensor};

use super::types::SourceInputs;
use crate::cache::DecoderCache;

/// Encoder output shared by every decoder step of a call.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Hidden states from the encoder `[batch, src_len, hidden_size]`.
    pub hidden_states: Tensor,
    /// Source mask `[batch, src_len]`, 1 = attend.
    pub attention_mask: Option<Tensor>,
    /// Source sequence length, stored separately for cross-attention masking
    /// so callers don't need to inspect tensor dimensions.
    pub src_len: usize,
    /// Per-example side output of the encoder (e.g. image-selection scores),
    /// returned to the caller unchanged.
    pub aux: Option<Tensor>,
}

impl EncoderOutput {
    /// The `src_len` is extracted from the tensor's second dimension.
    pub fn new(hidden_states: Tensor) -> Result<Self> {
        let src_len = hidden_states.dim(1)?;
        Ok(Self::with_src_len(hidden_states, src_len))
    }

    pub fn with_src_len(hidden_states: Tensor, src_len: usize) -> Self {
        Self {
            hidden_states,
            attention_mask: None,
            src_len,
            aux: None,
        }
    }

    pub fn with_attention_mask(mut self, attention_mask: Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_aux(mut self, aux: Tensor) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Repeat every example `num_beams` times along the batch axis
    /// (`[a, b]` becomes `[a, a, b, b]` for two beams).
    ///
    /// `aux` stays per example.
    pub fn expand_for_beams(&self, num_beams: usize) -> Result<Self> {
        let batch_size = self.hidden_states.dim(0)?;
        let indices: Vec<u32> = (0..batch_size as u32)
            .flat_map(|b| std::iter::repeat(b).take(num_beams))
            .collect();
        let indices = Tensor::new(indices.as_slice(), self.hidden_states.device())?;

        Ok(Self {
            hidden_states: self.hidden_states.index_select(&indices, 0)?,
            attention_mask: self
                .attention_mask
                .as_ref()
                .map(|mask| mask.index_select(&indices, 0))
                .transpose()?,
            src_len: self.src_len,
            aux: self.aux.clone(),
        })
    }
}

/// Result of one decoder step.
#[derive(Debug, Clone)]
pub struct DecoderStepOutput {
    /// Next-token logits, `[rows, vocab]` or `[rows, tgt_len, vocab]`
    /// (only the last position is used).
    pub logits: Tensor,
    /// Updated cache. `None` makes the next step re-feed the full history.
    pub cache: Option<DecoderCache>,
    /// Decoder attention weights for this step, recorded when requested.
    pub attentions: Option<Tensor>,
}

impl DecoderStepOutput {
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            cache: None,
            attentions: None,
        }
    }

    pub fn with_cache(mut self, cache: DecoderCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_attentions(mut self, attentions: Tensor) -> Self {
        self.attentions = Some(attentions);
        self
    }

    /// Logits of the last decoder position as `[rows, vocab]` f32.
    pub fn last_logits(&self) -> Result<Tensor> {
        let logits = match self.logits.rank() {
            3 => {
                let tgt_len = self.logits.dim(1)?;
                self.logits.narrow(1, tgt_len - 1, 1)?.squeeze(1)?
            }
            _ => self.logits.clone(),
        };
        logits.to_dtype(DType::F32)
    }
}

/// The scoring model driven by beam search.
///
/// Implementations must be deterministic: identical inputs and cache give
/// identical logits.
pub trait Seq2SeqScorer: Send + Sync {
    /// Run the encoder on the multimodal source.
    ///
    /// Called once per `generate` call; the result is expanded to one copy
    /// per beam and reused for all decoder steps.
    fn encode(&self, inputs: &SourceInputs) -> Result<EncoderOutput>;

    /// Score the next token for every beam row.
    ///
    /// # Arguments
    /// * `decoder_input_ids` - `[rows, 1]` (last token) when `cache` is
    ///   present, else the full history `[rows, cur_len]`
    /// * `encoder_output` - encoder states expanded to `rows`
    /// * `cache` - cache returned by the previous step, reordered to follow
    ///   the surviving beams
    fn decode_step(
        &self,
        decoder_input_ids: &Tensor,
        encoder_output: &EncoderOutput,
        cache: Option<&DecoderCache>,
    ) -> Result<DecoderStepOutput>;

    /// Token that seeds every decoder history.
    fn decoder_start_token_id(&self) -> u32;

    fn device(&self) -> &Device;

    fn is_encoder_decoder(&self) -> bool {
        true
    }

    /// Hook applied to `[rows, vocab]` logits before log-softmax.
    fn adjust_logits(&self, logits: Tensor, _cur_len: usize) -> Result<Tensor> {
        Ok(logits)
    }
}
