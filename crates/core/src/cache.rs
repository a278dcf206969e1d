//! Decoder key/value cache carried across beam-search steps.
//!
//! After every step the surviving beams may descend from any beam of the same
//! example, so self-attention entries are gathered along the beam axis to
//! follow their parents. Cross-attention entries depend only on the encoder
//! output, which is identical for all beams of an example, and are carried
//! over untouched.

use candle_core::Tensor;

use crate::error::{GenerationError, Result};

/// Cached tensors of one decoder layer. Beam axis is dimension 0.
#[derive(Debug, Clone)]
pub struct LayerCache {
    pub self_key: Tensor,
    pub self_value: Tensor,
    pub cross_key: Option<Tensor>,
    pub cross_value: Option<Tensor>,
}

impl LayerCache {
    pub fn new(self_key: Tensor, self_value: Tensor) -> Self {
        Self {
            self_key,
            self_value,
            cross_key: None,
            cross_value: None,
        }
    }

    pub fn with_cross_attention(mut self, cross_key: Tensor, cross_value: Tensor) -> Self {
        self.cross_key = Some(cross_key);
        self.cross_value = Some(cross_value);
        self
    }
}

/// Per-layer decoder cache, one entry per decoder layer.
#[derive(Debug, Clone, Default)]
pub struct DecoderCache {
    pub layers: Vec<LayerCache>,
}

impl DecoderCache {
    pub fn new(layers: Vec<LayerCache>) -> Self {
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of beam rows held, checked to agree across every layer.
    pub fn num_beams(&self) -> Result<usize> {
        let Some(first) = self.layers.first() else {
            return Ok(0);
        };
        let expected = first.self_key.dim(0)?;
        for layer in &self.layers {
            for tensor in [&layer.self_key, &layer.self_value] {
                let actual = tensor.dim(0)?;
                if actual != expected {
                    return Err(GenerationError::BeamCardinality { expected, actual });
                }
            }
        }
        Ok(expected)
    }

    /// Gather self-attention entries so that new row `i` holds old row `beam_idx[i]`.
    pub fn reorder(&self, beam_idx: &[usize]) -> Result<DecoderCache> {
        let Some(first) = self.layers.first() else {
            return Ok(self.clone());
        };
        let num_beams = self.num_beams()?;
        if beam_idx.len() != num_beams {
            return Err(GenerationError::BeamCardinality {
                expected: num_beams,
                actual: beam_idx.len(),
            });
        }
        if let Some(&index) = beam_idx.iter().find(|&&i| i >= num_beams) {
            return Err(GenerationError::ReorderOutOfRange { index, num_beams });
        }

        let indices: Vec<u32> = beam_idx.iter().map(|&i| i as u32).collect();
        let indices = Tensor::new(indices.as_slice(), first.self_key.device())?;

        let layers = self
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerCache {
                    self_key: layer.self_key.index_select(&indices, 0)?,
                    self_value: layer.self_value.index_select(&indices, 0)?,
                    cross_key: layer.cross_key.clone(),
                    cross_value: layer.cross_value.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DecoderCache { layers })
    }
}
