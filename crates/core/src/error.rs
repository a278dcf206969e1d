use thiserror::Error;

use crate::distributed::DistributedError;

/// Invalid generation arguments, detected before the decoding loop starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "both max_length ({max_length}) and max_new_tokens ({max_new_tokens}) are set; \
         they serve the same purpose, remove one of them"
    )]
    ConflictingLengths {
        max_length: usize,
        max_new_tokens: usize,
    },

    #[error("unfeasible length constraints: min_length {min_length} > max_length {max_length}")]
    MinLengthExceedsMax { min_length: usize, max_length: usize },

    #[error("num_beams must be at least 1")]
    ZeroBeams,

    #[error("num_return_sequences ({num_return_sequences}) has to be <= num_beams ({num_beams})")]
    ReturnSequencesExceedBeams {
        num_return_sequences: usize,
        num_beams: usize,
    },

    #[error("num_return_sequences must be at least 1")]
    ZeroReturnSequences,

    #[error("max_time must be a finite number of seconds > 0, got {0}")]
    InvalidMaxTime(f64),

    #[error("bad_words_ids entry {index} is empty")]
    EmptyBadWord { index: usize },

    #[error("encoder_no_repeat_ngram_size is set but no encoder input ids were given")]
    MissingEncoderInputIds,

    #[error("num_beam_groups ({num_beam_groups}) has to be <= num_beams ({num_beams})")]
    BeamGroupsExceedBeams {
        num_beam_groups: usize,
        num_beams: usize,
    },

    #[error("num_beams ({num_beams}) must be divisible by num_beam_groups ({num_beam_groups})")]
    BeamsNotDivisibleByGroups {
        num_beams: usize,
        num_beam_groups: usize,
    },

    #[error("diversity_penalty requires num_beam_groups > 1")]
    DiversityWithoutGroups,

    #[error("no stopping criteria configured, generation would never terminate")]
    NoStoppingCriteria,

    #[error("a max-length stopping criterion is required for beam search")]
    MissingMaxLength,

    #[error("encoder_no_repeat_ngram_size cannot be used with a decoder-only scorer")]
    EncoderNgramOnDecoderOnly,

    #[error(
        "a custom logits processor `{name}` was passed, but one was already built from \
         the generation arguments"
    )]
    DuplicateProcessor { name: &'static str },

    #[error(
        "a custom stopping criterion `{name}` was passed, but one was already built from \
         the generation arguments"
    )]
    DuplicateCriterion { name: &'static str },

    #[error("no eos_token_id configured")]
    MissingEosToken,

    #[error("batch has no examples")]
    EmptyBatch,

    #[error("invalid generation config: {0}")]
    Parse(String),
}

/// Fatal conditions that abort a `generate` call.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("non-finite score {value} at step {step} (beam {beam}, token {token})")]
    NonFiniteScore {
        step: usize,
        beam: usize,
        token: usize,
        value: f32,
    },

    #[error("beam index {index} out of range for {num_beams} cached beams")]
    ReorderOutOfRange { index: usize, num_beams: usize },

    #[error("beam cardinality mismatch: expected {expected} rows, got {actual}")]
    BeamCardinality { expected: usize, actual: usize },

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error(transparent)]
    Distributed(#[from] DistributedError),
}

pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_conflicting_lengths() {
        let e = ConfigError::ConflictingLengths {
            max_length: 20,
            max_new_tokens: 10,
        };
        assert!(e.to_string().starts_with("both max_length (20) and max_new_tokens (10)"));
    }

    #[test]
    fn error_display_return_sequences() {
        let e = ConfigError::ReturnSequencesExceedBeams {
            num_return_sequences: 5,
            num_beams: 4,
        };
        assert_eq!(
            e.to_string(),
            "num_return_sequences (5) has to be <= num_beams (4)"
        );
    }

    #[test]
    fn config_error_is_transparent_in_generation_error() {
        let e: GenerationError = ConfigError::NoStoppingCriteria.into();
        assert_eq!(
            e.to_string(),
            "no stopping criteria configured, generation would never terminate"
        );
        assert!(matches!(
            e,
            GenerationError::Config(ConfigError::NoStoppingCriteria)
        ));
    }

    #[test]
    fn error_display_reorder_out_of_range() {
        let e = GenerationError::ReorderOutOfRange {
            index: 7,
            num_beams: 4,
        };
        assert_eq!(e.to_string(), "beam index 7 out of range for 4 cached beams");
    }
}
