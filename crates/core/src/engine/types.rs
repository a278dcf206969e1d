//! Request and result types for `generate`.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::config::GenerationOverrides;
use crate::distributed::TerminationBarrier;
use crate::logits::{LogitsProcessor, PrefixAllowedTokensFn};
use crate::stopping::StoppingCriteria;

// ─── Source inputs ────────────────────────────────────────────────────────

/// Multimodal source of a batch: text, optional image regions, optional
/// knowledge-graph entities. All tensors share the batch axis.
#[derive(Debug, Clone)]
pub struct SourceInputs {
    /// Source token ids `[batch, text_len]`.
    pub input_ids: Tensor,
    /// `[batch, text_len]`, 1 = real token.
    pub attention_mask: Option<Tensor>,
    /// Image region features `[batch, image_len, d_image]`.
    pub image_features: Option<Tensor>,
    /// `[batch, image_len]`, 1 = real region.
    pub image_mask: Option<Tensor>,
    /// Marks the per-image summary positions `[batch, image_len]`.
    pub image_cls_mask: Option<Tensor>,
    /// Entity ids `[batch, num_entities]`, attended by the decoder.
    pub entity_ids: Option<Tensor>,
    pub entity_mask: Option<Tensor>,
}

impl SourceInputs {
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            image_features: None,
            image_mask: None,
            image_cls_mask: None,
            entity_ids: None,
            entity_mask: None,
        }
    }

    pub fn with_attention_mask(mut self, attention_mask: Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_images(
        mut self,
        features: Tensor,
        mask: Option<Tensor>,
        cls_mask: Option<Tensor>,
    ) -> Self {
        self.image_features = Some(features);
        self.image_mask = mask;
        self.image_cls_mask = cls_mask;
        self
    }

    pub fn with_entities(mut self, entity_ids: Tensor, entity_mask: Option<Tensor>) -> Self {
        self.entity_ids = Some(entity_ids);
        self.entity_mask = entity_mask;
        self
    }

    pub fn batch_size(&self) -> candle_core::Result<usize> {
        self.input_ids.dim(0)
    }

    /// Source token ids, one row per example.
    pub fn token_ids(&self) -> candle_core::Result<Vec<Vec<u32>>> {
        self.input_ids.to_dtype(DType::U32)?.to_vec2()
    }

    /// Encoder mask over the concatenated `[text, image]` sequence.
    ///
    /// A missing text or image mask counts as all ones.
    pub fn combined_attention_mask(&self) -> candle_core::Result<Tensor> {
        let text_mask = match &self.attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones(self.input_ids.dims2()?, DType::F32, self.input_ids.device())?,
        };
        let Some(features) = &self.image_features else {
            return Ok(text_mask);
        };
        let image_mask = match &self.image_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => {
                let (batch, image_len, _) = features.dims3()?;
                Tensor::ones((batch, image_len), DType::F32, features.device())?
            }
        };
        Tensor::cat(&[&text_mask, &image_mask], 1)
    }
}

// ─── Request ──────────────────────────────────────────────────────────────

/// Per-call arguments of `generate`.
#[derive(Default)]
pub struct GenerateRequest {
    pub overrides: GenerationOverrides,
    /// Merged after the default processors; tags must not collide with them.
    pub logits_processors: Vec<Box<dyn LogitsProcessor>>,
    /// Merged with the default criteria; tags must not collide with them.
    pub stopping_criteria: Vec<Box<dyn StoppingCriteria>>,
    pub prefix_allowed_tokens_fn: Option<PrefixAllowedTokensFn>,
    /// Keeps several peers stepping together until all are done.
    pub barrier: Option<Arc<dyn TerminationBarrier>>,
}

impl GenerateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_logits_processor(mut self, processor: Box<dyn LogitsProcessor>) -> Self {
        self.logits_processors.push(processor);
        self
    }

    pub fn with_stopping_criteria(mut self, criterion: Box<dyn StoppingCriteria>) -> Self {
        self.stopping_criteria.push(criterion);
        self
    }

    pub fn with_prefix_allowed_tokens_fn(mut self, allowed: PrefixAllowedTokensFn) -> Self {
        self.prefix_allowed_tokens_fn = Some(allowed);
        self
    }

    pub fn with_barrier(mut self, barrier: Arc<dyn TerminationBarrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }
}

// ─── Output ───────────────────────────────────────────────────────────────

/// Result of a `generate` call.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    /// `batch * num_return_sequences` sequences, example-major, right-padded.
    pub sequences: Vec<Vec<u32>>,
    /// Length-normalized score of each returned sequence.
    pub sequences_scores: Vec<f32>,
    /// Processed log-probabilities of every step, `[step][row][vocab]`.
    pub scores: Option<Vec<Vec<Vec<f32>>>>,
    /// Beam row chosen at each step for every returned sequence.
    pub beam_indices: Option<Vec<Vec<usize>>>,
    /// Decoder attentions of every step, as returned by the scorer.
    pub attentions: Option<Vec<Tensor>>,
    /// Encoder side output, one entry per example.
    pub encoder_aux: Option<Tensor>,
}

impl GenerateOutput {
    /// Sequences as a `[n, len]` u32 tensor.
    pub fn sequences_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let rows = self.sequences.len();
        let len = self.sequences.first().map_or(0, Vec::len);
        let flat: Vec<u32> = self.sequences.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows, len), device)
    }
}
