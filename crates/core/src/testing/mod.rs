//! Shared test utilities for mmgen-core.
//!
//! Provides a scriptable [`MockScorer`] so the decoding loop can be exercised
//! without a real network.

mod mock_model;

pub use mock_model::{MockScorer, NextLogitsFn};
