//! Beam-search generation for multimodal sequence-to-sequence models.
//!
//! The model is reached through [`engine::Seq2SeqScorer`]; everything else
//! (score transforms, stopping, hypothesis bookkeeping, cache reordering and
//! the decoding loop) lives here.

pub mod beam;
pub mod cache;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod logits;
pub mod stopping;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{GenerationConfig, GenerationOverrides, GenerationParams};
pub use engine::{generate, GenerateOutput, GenerateRequest, Seq2SeqScorer, SourceInputs};
pub use error::{ConfigError, GenerationError, Result};
