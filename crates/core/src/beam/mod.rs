//! Beam search bookkeeping.
//!
//! Each (example, diversity group) pair owns a pool: `group_size` live beams
//! that the driver carries forward, plus a bounded set of finished hypotheses
//! ranked by `sum_logprobs / len^length_penalty`.

mod hypotheses;
mod scorer;

pub use hypotheses::{BeamHypotheses, BeamHypothesis, FinishedHypothesis};
pub use scorer::{
    select_top_candidates, BeamSearchOutput, BeamSearchScorer, BeamStepOutput, Candidate,
    DUMMY_BEAM_SCORE,
};
