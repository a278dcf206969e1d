//! Generation configuration.
//!
//! [`GenerationConfig`] holds model-level defaults (deserializable from a
//! `generation_config.json`-style file). Per-call [`GenerationOverrides`] are
//! merged over it exactly once, at `generate` entry, into a fully resolved
//! [`GenerationParams`]; nothing inside the decoding loop consults defaults.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Model-level generation defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub min_length: usize,
    pub num_beams: usize,
    pub num_beam_groups: usize,
    pub diversity_penalty: f32,
    /// Exponent applied to the hypothesis length when ranking finished beams.
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub num_return_sequences: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub encoder_no_repeat_ngram_size: usize,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    pub bos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub decoder_start_token_id: Option<u32>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub remove_invalid_values: bool,
    /// `(start_index, decay_factor)`.
    pub exponential_decay_length_penalty: Option<(usize, f32)>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    /// `(generation_index, token_id)` pairs.
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub renormalize_logits: bool,
    pub output_scores: bool,
    pub output_attentions: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            min_length: 0,
            num_beams: 4,
            num_beam_groups: 1,
            diversity_penalty: 0.0,
            length_penalty: 1.0,
            early_stopping: false,
            num_return_sequences: 1,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            encoder_no_repeat_ngram_size: 0,
            bad_words_ids: None,
            bos_token_id: None,
            pad_token_id: None,
            eos_token_id: None,
            decoder_start_token_id: None,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            remove_invalid_values: false,
            exponential_decay_length_penalty: None,
            suppress_tokens: None,
            begin_suppress_tokens: None,
            forced_decoder_ids: None,
            renormalize_logits: false,
            output_scores: false,
            output_attentions: false,
        }
    }
}

impl GenerationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }
}

/// Per-call overrides. `None` falls back to the [`GenerationConfig`] value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOverrides {
    pub max_length: Option<usize>,
    /// Mutually exclusive with `max_length`.
    pub max_new_tokens: Option<usize>,
    pub min_length: Option<usize>,
    pub num_beams: Option<usize>,
    pub num_beam_groups: Option<usize>,
    pub diversity_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub early_stopping: Option<bool>,
    pub num_return_sequences: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub no_repeat_ngram_size: Option<usize>,
    pub encoder_no_repeat_ngram_size: Option<usize>,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub decoder_start_token_id: Option<u32>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub remove_invalid_values: Option<bool>,
    pub exponential_decay_length_penalty: Option<(usize, f32)>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub renormalize_logits: Option<bool>,
    /// Wall-clock budget in seconds.
    pub max_time: Option<f64>,
    pub output_scores: Option<bool>,
    pub output_attentions: Option<bool>,
}

/// Fully resolved and validated parameters for one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_length: usize,
    pub min_length: usize,
    pub num_beams: usize,
    pub num_beam_groups: usize,
    pub diversity_penalty: f32,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub num_return_sequences: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub encoder_no_repeat_ngram_size: usize,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub decoder_start_token_id: u32,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub remove_invalid_values: bool,
    pub exponential_decay_length_penalty: Option<(usize, f32)>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub renormalize_logits: bool,
    pub max_time: Option<f64>,
    pub output_scores: bool,
    pub output_attentions: bool,
    /// Length of the decoder prompt the search starts from.
    pub input_len: usize,
}

impl GenerationParams {
    /// Merge `overrides` over `config` and validate the result.
    ///
    /// `model_start_token_id` is the scorer's decoder start token, used when
    /// neither the overrides nor the config name one.
    pub fn resolve(
        config: &GenerationConfig,
        overrides: &GenerationOverrides,
        model_start_token_id: u32,
        is_encoder_decoder: bool,
    ) -> Result<Self, ConfigError> {
        let input_len = 1;

        let eos_token_id = overrides
            .eos_token_id
            .or(config.eos_token_id)
            .ok_or(ConfigError::MissingEosToken)?;
        let pad_token_id = match overrides.pad_token_id.or(config.pad_token_id) {
            Some(pad) => pad,
            None => {
                tracing::warn!(
                    eos_token_id,
                    "pad_token_id not set, using eos_token_id for padding"
                );
                eos_token_id
            }
        };

        let max_length = match (overrides.max_length, overrides.max_new_tokens) {
            (Some(max_length), Some(max_new_tokens)) => {
                return Err(ConfigError::ConflictingLengths {
                    max_length,
                    max_new_tokens,
                })
            }
            (Some(max_length), None) => max_length,
            (None, Some(max_new_tokens)) => max_new_tokens + input_len,
            (None, None) => {
                tracing::debug!(
                    max_length = config.max_length,
                    "neither max_length nor max_new_tokens given, using config max_length"
                );
                config.max_length
            }
        };
        let min_length = overrides.min_length.unwrap_or(config.min_length);
        if min_length > max_length {
            return Err(ConfigError::MinLengthExceedsMax {
                min_length,
                max_length,
            });
        }
        if input_len >= max_length {
            tracing::warn!(
                input_len,
                max_length,
                "decoder input is already at max_length, consider increasing max_new_tokens"
            );
        }

        let num_beams = overrides.num_beams.unwrap_or(config.num_beams);
        if num_beams == 0 {
            return Err(ConfigError::ZeroBeams);
        }
        let num_return_sequences = overrides
            .num_return_sequences
            .unwrap_or(config.num_return_sequences);
        if num_return_sequences == 0 {
            return Err(ConfigError::ZeroReturnSequences);
        }
        if num_return_sequences > num_beams {
            return Err(ConfigError::ReturnSequencesExceedBeams {
                num_return_sequences,
                num_beams,
            });
        }
        let num_beam_groups = overrides
            .num_beam_groups
            .unwrap_or(config.num_beam_groups)
            .max(1);
        if num_beam_groups > num_beams {
            return Err(ConfigError::BeamGroupsExceedBeams {
                num_beam_groups,
                num_beams,
            });
        }
        if num_beams % num_beam_groups != 0 {
            return Err(ConfigError::BeamsNotDivisibleByGroups {
                num_beams,
                num_beam_groups,
            });
        }
        let diversity_penalty = overrides
            .diversity_penalty
            .unwrap_or(config.diversity_penalty);
        if diversity_penalty > 0.0 && num_beam_groups == 1 {
            return Err(ConfigError::DiversityWithoutGroups);
        }

        if let Some(max_time) = overrides.max_time {
            if !max_time.is_finite() || max_time <= 0.0 {
                return Err(ConfigError::InvalidMaxTime(max_time));
            }
        }

        let bad_words_ids = overrides
            .bad_words_ids
            .clone()
            .or_else(|| config.bad_words_ids.clone());
        if let Some(index) = bad_words_ids
            .as_ref()
            .and_then(|words| words.iter().position(Vec::is_empty))
        {
            return Err(ConfigError::EmptyBadWord { index });
        }

        let encoder_no_repeat_ngram_size = overrides
            .encoder_no_repeat_ngram_size
            .unwrap_or(config.encoder_no_repeat_ngram_size);
        if encoder_no_repeat_ngram_size > 0 && !is_encoder_decoder {
            return Err(ConfigError::EncoderNgramOnDecoderOnly);
        }

        Ok(Self {
            max_length,
            min_length,
            num_beams,
            num_beam_groups,
            diversity_penalty,
            length_penalty: overrides.length_penalty.unwrap_or(config.length_penalty),
            early_stopping: overrides.early_stopping.unwrap_or(config.early_stopping),
            num_return_sequences,
            repetition_penalty: overrides
                .repetition_penalty
                .unwrap_or(config.repetition_penalty),
            no_repeat_ngram_size: overrides
                .no_repeat_ngram_size
                .unwrap_or(config.no_repeat_ngram_size),
            encoder_no_repeat_ngram_size,
            bad_words_ids,
            pad_token_id,
            eos_token_id,
            decoder_start_token_id: overrides
                .decoder_start_token_id
                .or(config.decoder_start_token_id)
                .unwrap_or(model_start_token_id),
            forced_bos_token_id: overrides.forced_bos_token_id.or(config.forced_bos_token_id),
            forced_eos_token_id: overrides.forced_eos_token_id.or(config.forced_eos_token_id),
            remove_invalid_values: overrides
                .remove_invalid_values
                .unwrap_or(config.remove_invalid_values),
            exponential_decay_length_penalty: overrides
                .exponential_decay_length_penalty
                .or(config.exponential_decay_length_penalty),
            suppress_tokens: overrides
                .suppress_tokens
                .clone()
                .or_else(|| config.suppress_tokens.clone()),
            begin_suppress_tokens: overrides
                .begin_suppress_tokens
                .clone()
                .or_else(|| config.begin_suppress_tokens.clone()),
            forced_decoder_ids: overrides
                .forced_decoder_ids
                .clone()
                .or_else(|| config.forced_decoder_ids.clone()),
            renormalize_logits: overrides
                .renormalize_logits
                .unwrap_or(config.renormalize_logits),
            max_time: overrides.max_time,
            output_scores: overrides.output_scores.unwrap_or(config.output_scores),
            output_attentions: overrides
                .output_attentions
                .unwrap_or(config.output_attentions),
            input_len,
        })
    }

    /// Beams per diversity group.
    pub fn group_size(&self) -> usize {
        self.num_beams / self.num_beam_groups
    }
}
