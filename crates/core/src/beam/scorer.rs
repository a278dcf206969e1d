//! Per-step beam bookkeeping and final hypothesis selection.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::hypotheses::{BeamHypotheses, BeamHypothesis, FinishedHypothesis};
use crate::error::{GenerationError, Result};

/// Score given to filler slots when a pool runs out of live candidates.
/// Low enough that no real continuation ever ranks below it.
pub const DUMMY_BEAM_SCORE: f32 = -1e9;

/// One expansion of a beam row by a token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Cumulative log probability if this token is selected.
    pub score: f32,
    pub token_id: u32,
    /// Row within the example's group (`0..group_size`).
    pub beam_index: usize,
}

#[derive(Debug, Clone, Copy)]
struct RankedCandidate {
    score: f32,
    flat_index: usize,
}

impl PartialEq for RankedCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedCandidate {}

impl PartialOrd for RankedCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedCandidate {
    // Greater means worse, so the heap top is the candidate to drop.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.flat_index.cmp(&other.flat_index))
    }
}

/// Top `2 * group_size` candidates of every example, best first.
///
/// `scores` holds `batch * group_size` rows of cumulative scores. Each
/// example's rows are flattened to `beam * vocab + token`; equal scores go
/// to the lower flattened index.
pub fn select_top_candidates(scores: &[Vec<f32>], group_size: usize) -> Vec<Vec<Candidate>> {
    if group_size == 0 {
        return Vec::new();
    }
    let vocab_size = scores.first().map_or(0, Vec::len);
    let k = (2 * group_size).min(group_size * vocab_size);

    scores
        .chunks(group_size)
        .map(|rows| {
            let mut heap: BinaryHeap<RankedCandidate> = BinaryHeap::with_capacity(k + 1);
            for (beam, row) in rows.iter().enumerate() {
                for (token, &score) in row.iter().enumerate() {
                    let candidate = RankedCandidate {
                        score,
                        flat_index: beam * vocab_size + token,
                    };
                    if heap.len() < k {
                        heap.push(candidate);
                    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            heap.into_sorted_vec()
                .into_iter()
                .map(|c| Candidate {
                    score: c.score,
                    token_id: (c.flat_index % vocab_size) as u32,
                    beam_index: c.flat_index / vocab_size,
                })
                .collect()
        })
        .collect()
}

/// Next live beams of one diversity group, `batch * group_size` entries each.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStepOutput {
    pub next_beam_scores: Vec<f32>,
    pub next_beam_tokens: Vec<u32>,
    /// Parent row within the group rows (`batch_idx * group_size + beam`).
    pub next_beam_indices: Vec<usize>,
}

/// Final hypotheses, `batch * num_return_sequences` entries, example-major.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchOutput {
    /// Right-padded with the pad token to a common length.
    pub sequences: Vec<Vec<u32>>,
    pub sequence_scores: Vec<f32>,
    /// Beam row chosen at each step, empty unless lineage was tracked.
    pub beam_indices: Vec<Vec<usize>>,
}

/// Beam search bookkeeping across all examples and diversity groups.
#[derive(Debug)]
pub struct BeamSearchScorer {
    batch_size: usize,
    num_beams: usize,
    num_beam_groups: usize,
    group_size: usize,
    num_beam_hyps_to_keep: usize,
    /// Indexed by `batch_idx * num_beam_groups + group_idx`.
    beam_hyps: Vec<BeamHypotheses>,
    done: Vec<bool>,
    next_insertion: u64,
}

impl BeamSearchScorer {
    pub fn new(
        batch_size: usize,
        num_beams: usize,
        num_beam_groups: usize,
        length_penalty: f32,
        do_early_stopping: bool,
        num_beam_hyps_to_keep: usize,
    ) -> Self {
        let num_beam_groups = num_beam_groups.max(1);
        let group_size = num_beams / num_beam_groups;
        let pools = batch_size * num_beam_groups;
        Self {
            batch_size,
            num_beams,
            num_beam_groups,
            group_size,
            num_beam_hyps_to_keep,
            beam_hyps: (0..pools)
                .map(|_| BeamHypotheses::new(group_size, length_penalty, do_early_stopping))
                .collect(),
            done: vec![false; pools],
            next_insertion: 0,
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// True once every pool is done.
    pub fn is_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    /// Finished hypotheses retained so far by the pool of `(batch_idx, group_idx)`.
    pub fn hypotheses(&self, batch_idx: usize, group_idx: usize) -> &BeamHypotheses {
        &self.beam_hyps[batch_idx * self.num_beam_groups + group_idx]
    }

    fn global_row(&self, batch_idx: usize, group_idx: usize, beam: usize) -> usize {
        batch_idx * self.num_beams + group_idx * self.group_size + beam
    }

    fn next_insertion(&mut self) -> u64 {
        let insertion = self.next_insertion;
        self.next_insertion += 1;
        insertion
    }

    /// Consume one step's candidates for diversity group `group_idx`.
    ///
    /// `input_ids` holds the group rows (`batch * group_size`), and
    /// `candidates` the output of [`select_top_candidates`] over them.
    /// `beam_indices`, when given, is the lineage of every global row.
    pub fn process(
        &mut self,
        input_ids: &[Vec<u32>],
        candidates: &[Vec<Candidate>],
        pad_token_id: u32,
        eos_token_id: u32,
        group_idx: usize,
        beam_indices: Option<&[Vec<usize>]>,
    ) -> Result<BeamStepOutput> {
        let expected_rows = self.batch_size * self.group_size;
        if input_ids.len() != expected_rows {
            return Err(GenerationError::BeamCardinality {
                expected: expected_rows,
                actual: input_ids.len(),
            });
        }
        if candidates.len() != self.batch_size {
            return Err(GenerationError::BeamCardinality {
                expected: self.batch_size,
                actual: candidates.len(),
            });
        }
        let cur_len = input_ids.first().map_or(0, Vec::len);

        let mut out = BeamStepOutput {
            next_beam_scores: Vec::with_capacity(expected_rows),
            next_beam_tokens: Vec::with_capacity(expected_rows),
            next_beam_indices: Vec::with_capacity(expected_rows),
        };

        for (batch_idx, example_candidates) in candidates.iter().enumerate() {
            let pool = batch_idx * self.num_beam_groups + group_idx;
            let first_row = batch_idx * self.group_size;

            if self.done[pool] {
                for _ in 0..self.group_size {
                    out.next_beam_scores.push(0.0);
                    out.next_beam_tokens.push(pad_token_id);
                    out.next_beam_indices.push(first_row);
                }
                continue;
            }

            let mut live = 0;
            for (rank, candidate) in example_candidates.iter().enumerate() {
                let row = first_row + candidate.beam_index;
                if candidate.token_id == eos_token_id {
                    // Only EOS candidates that would have made the live set count.
                    if rank >= self.group_size {
                        continue;
                    }
                    let global_row = self.global_row(batch_idx, group_idx, candidate.beam_index);
                    let mut lineage = beam_indices
                        .and_then(|b| b.get(global_row))
                        .cloned()
                        .unwrap_or_default();
                    if beam_indices.is_some() {
                        lineage.push(global_row);
                    }
                    let insertion = self.next_insertion();
                    self.beam_hyps[pool].add(
                        BeamHypothesis {
                            token_ids: input_ids[row].clone(),
                            score: candidate.score,
                            is_finished: true,
                            parent_beam_idx: global_row,
                            beam_indices: lineage,
                        },
                        insertion,
                    );
                } else {
                    out.next_beam_scores.push(candidate.score);
                    out.next_beam_tokens.push(candidate.token_id);
                    out.next_beam_indices.push(row);
                    live += 1;
                }
                if live == self.group_size {
                    break;
                }
            }

            if live < self.group_size {
                tracing::warn!(
                    batch_idx,
                    group_idx,
                    live,
                    group_size = self.group_size,
                    "not enough live candidates, filling with dummy beams"
                );
                for _ in live..self.group_size {
                    out.next_beam_scores.push(DUMMY_BEAM_SCORE);
                    out.next_beam_tokens.push(pad_token_id);
                    out.next_beam_indices.push(first_row);
                }
            }

            let best_sum_logprobs = example_candidates
                .first()
                .map_or(f32::NEG_INFINITY, |c| c.score);
            self.done[pool] = self.beam_hyps[pool].is_done(best_sum_logprobs, cur_len);
        }

        Ok(out)
    }

    /// Select the returned sequences once generation stops.
    ///
    /// `input_ids` and `final_beam_scores` cover all `batch * num_beams` rows.
    /// Pools that are not done admit their live beams before ranking.
    pub fn finalize(
        mut self,
        input_ids: &[Vec<u32>],
        final_beam_scores: &[f32],
        pad_token_id: u32,
        eos_token_id: u32,
        max_length: usize,
        beam_indices: Option<&[Vec<usize>]>,
    ) -> Result<BeamSearchOutput> {
        let expected_rows = self.batch_size * self.num_beams;
        for actual in [input_ids.len(), final_beam_scores.len()] {
            if actual != expected_rows {
                return Err(GenerationError::BeamCardinality {
                    expected: expected_rows,
                    actual,
                });
            }
        }

        for batch_idx in 0..self.batch_size {
            for group_idx in 0..self.num_beam_groups {
                let pool = batch_idx * self.num_beam_groups + group_idx;
                if self.done[pool] {
                    continue;
                }
                for beam in 0..self.group_size {
                    let row = self.global_row(batch_idx, group_idx, beam);
                    let insertion = self.next_insertion();
                    self.beam_hyps[pool].add(
                        BeamHypothesis {
                            token_ids: input_ids[row].clone(),
                            score: final_beam_scores[row],
                            is_finished: false,
                            parent_beam_idx: row,
                            beam_indices: beam_indices
                                .and_then(|b| b.get(row))
                                .cloned()
                                .unwrap_or_default(),
                        },
                        insertion,
                    );
                }
            }
        }

        let num_groups = self.num_beam_groups;
        let mut best: Vec<FinishedHypothesis> =
            Vec::with_capacity(self.batch_size * self.num_beam_hyps_to_keep);
        let mut pools = self.beam_hyps.into_iter();
        for _ in 0..self.batch_size {
            let mut example: Vec<FinishedHypothesis> = pools
                .by_ref()
                .take(num_groups)
                .flat_map(BeamHypotheses::into_sorted)
                .collect();
            example.sort();
            best.extend(example.into_iter().take(self.num_beam_hyps_to_keep));
        }

        let decoded: Vec<Vec<u32>> = best
            .iter()
            .map(|h| {
                let mut tokens = h.hypothesis.token_ids.clone();
                if h.hypothesis.is_finished && tokens.len() < max_length {
                    tokens.push(eos_token_id);
                }
                tokens
            })
            .collect();
        let sent_max_len = decoded.iter().map(Vec::len).max().unwrap_or(0);

        Ok(BeamSearchOutput {
            sequences: decoded
                .into_iter()
                .map(|mut tokens| {
                    tokens.resize(sent_max_len, pad_token_id);
                    tokens
                })
                .collect(),
            sequence_scores: best.iter().map(|h| h.score).collect(),
            beam_indices: best
                .into_iter()
                .map(|h| h.hypothesis.beam_indices)
                .collect(),
        })
    }
}
