//! Beam-search decoding driver.
//!
//! [`generate`] runs the whole search for a batch of multimodal sources:
//!
//! - **Resolve**: merge per-call overrides over the model defaults once and
//!   build the logits processor and stopping lists
//! - **Init**: encode the source, expand it to one copy per beam, seed every
//!   history with the decoder start token
//! - **Step**: score, transform, select the top candidates per example, hand
//!   them to the [`BeamSearchScorer`], then reorder histories and cache
//! - **Finalize**: pick the best `num_return_sequences` hypotheses per example
//!
//! # Example
//!
//! ```ignore
//! let output = generate(&model, &inputs, &config, GenerateRequest::new())?;
//! for (seq, score) in output.sequences.iter().zip(&output.sequences_scores) {
//!     println!("{score:.3} {seq:?}");
//! }
//! ```

mod encoder_decoder;
mod types;

use std::borrow::Cow;

use candle_core::{Device, Tensor, D};

pub use encoder_decoder::{DecoderStepOutput, EncoderOutput, Seq2SeqScorer};
pub use types::{GenerateOutput, GenerateRequest, SourceInputs};

use crate::beam::{select_top_candidates, BeamSearchScorer, DUMMY_BEAM_SCORE};
use crate::cache::DecoderCache;
use crate::config::{GenerationConfig, GenerationParams};
use crate::error::{ConfigError, GenerationError, Result};
use crate::logits::{GroupContext, LogitsProcessorList};
use crate::stopping::StoppingCriteriaList;

/// Run beam search for every example of `inputs`.
///
/// With a barrier in the request, a peer that finishes keeps calling the
/// scorer (results discarded) until every peer is done. Any error aborts the
/// barrier so that waiting peers are released.
pub fn generate(
    scorer: &dyn Seq2SeqScorer,
    inputs: &SourceInputs,
    config: &GenerationConfig,
    request: GenerateRequest,
) -> Result<GenerateOutput> {
    let barrier = request.barrier.clone();
    let result = run(scorer, inputs, config, request);
    if let (Err(err), Some(barrier)) = (&result, &barrier) {
        tracing::warn!(rank = barrier.rank(), error = %err, "generation failed, aborting peers");
        barrier.abort();
    }
    result
}

fn run(
    scorer: &dyn Seq2SeqScorer,
    inputs: &SourceInputs,
    config: &GenerationConfig,
    request: GenerateRequest,
) -> Result<GenerateOutput> {
    let GenerateRequest {
        overrides,
        logits_processors,
        stopping_criteria,
        prefix_allowed_tokens_fn,
        barrier,
    } = request;

    let params = GenerationParams::resolve(
        config,
        &overrides,
        scorer.decoder_start_token_id(),
        scorer.is_encoder_decoder(),
    )?;
    let batch_size = inputs.batch_size()?;
    if batch_size == 0 {
        return Err(ConfigError::EmptyBatch.into());
    }

    let encoder_input_ids = if params.encoder_no_repeat_ngram_size > 0 {
        Some(inputs.token_ids()?)
    } else {
        None
    };
    let processors = LogitsProcessorList::from_params(
        &params,
        encoder_input_ids.as_deref(),
        prefix_allowed_tokens_fn,
        logits_processors,
    )?;
    let stopping = StoppingCriteriaList::from_params(&params, stopping_criteria)?;
    let max_length = stopping.max_length().ok_or(ConfigError::MissingMaxLength)?;

    let encoder_output = scorer.encode(inputs)?;
    let encoder_aux = encoder_output.aux.clone();
    let encoder_output = encoder_output.expand_for_beams(params.num_beams)?;

    tracing::debug!(
        batch_size,
        num_beams = params.num_beams,
        num_beam_groups = params.num_beam_groups,
        max_length,
        "starting beam search"
    );

    let mut state = SearchState::new(&params, batch_size);
    let mut beam_scorer = BeamSearchScorer::new(
        batch_size,
        params.num_beams,
        params.num_beam_groups,
        params.length_penalty,
        params.early_stopping,
        params.num_return_sequences,
    );

    let mut this_peer_finished = false;
    loop {
        if let Some(barrier) = &barrier {
            if barrier.all_finished(this_peer_finished)? {
                break;
            }
        }

        let decoder_input_ids = state.decoder_input_ids(scorer.device())?;
        let step_output = scorer.decode_step(&decoder_input_ids, &encoder_output, state.cache.as_ref())?;
        if this_peer_finished {
            // Keep pace with peers that are still decoding.
            state.cur_len += 1;
            continue;
        }

        let logits = scorer.adjust_logits(step_output.last_logits()?, state.cur_len)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let next_token_scores: Vec<Vec<f32>> = log_probs.to_vec2()?;
        if next_token_scores.len() != state.num_rows() {
            return Err(GenerationError::BeamCardinality {
                expected: state.num_rows(),
                actual: next_token_scores.len(),
            });
        }

        state.step(&params, &processors, &mut beam_scorer, next_token_scores)?;
        state.cache = step_output
            .cache
            .map(|cache| cache.reorder(&state.last_parents))
            .transpose()?;
        if params.output_attentions {
            if let Some(attentions) = step_output.attentions {
                state.attentions.push(attentions);
            }
        }

        let last_scores = state.scores.last().map(Vec::as_slice);
        let done = beam_scorer.is_done() || stopping.is_done(&state.input_ids, last_scores);
        tracing::debug!(step = state.step, cur_len = state.cur_len, done, "beam search step");
        if done {
            match barrier {
                Some(_) => this_peer_finished = true,
                None => break,
            }
        }
    }

    let output = beam_scorer.finalize(
        &state.input_ids,
        &state.beam_scores,
        params.pad_token_id,
        params.eos_token_id,
        max_length,
        state.lineage.as_deref(),
    )?;

    tracing::info!(
        batch_size,
        steps = state.step,
        num_sequences = output.sequences.len(),
        "beam search finished"
    );

    Ok(GenerateOutput {
        sequences: output.sequences,
        sequences_scores: output.sequence_scores,
        scores: params.output_scores.then_some(state.scores),
        beam_indices: state.lineage.is_some().then_some(output.beam_indices),
        attentions: params.output_attentions.then_some(state.attentions),
        encoder_aux,
    })
}

/// Mutable search state, rows in example-major order.
struct SearchState {
    num_beams: usize,
    num_beam_groups: usize,
    group_size: usize,
    batch_size: usize,
    input_ids: Vec<Vec<u32>>,
    beam_scores: Vec<f32>,
    cur_len: usize,
    step: usize,
    cache: Option<DecoderCache>,
    /// Parent row of every row after the latest step.
    last_parents: Vec<usize>,
    /// Beam row chosen at every step, tracked when scores are recorded.
    lineage: Option<Vec<Vec<usize>>>,
    scores: Vec<Vec<Vec<f32>>>,
    attentions: Vec<Tensor>,
    record_scores: bool,
}

impl SearchState {
    fn new(params: &GenerationParams, batch_size: usize) -> Self {
        let num_rows = batch_size * params.num_beams;
        let group_size = params.group_size();

        // Only the first beam of each group starts live, so the first step
        // does not pick the same token from identical beams.
        let beam_scores = (0..num_rows)
            .map(|row| {
                if (row % params.num_beams) % group_size == 0 {
                    0.0
                } else {
                    DUMMY_BEAM_SCORE
                }
            })
            .collect();

        Self {
            num_beams: params.num_beams,
            num_beam_groups: params.num_beam_groups,
            group_size,
            batch_size,
            input_ids: vec![vec![params.decoder_start_token_id]; num_rows],
            beam_scores,
            cur_len: params.input_len,
            step: 0,
            cache: None,
            last_parents: (0..num_rows).collect(),
            lineage: params.output_scores.then(|| vec![Vec::new(); num_rows]),
            scores: Vec::new(),
            attentions: Vec::new(),
            record_scores: params.output_scores,
        }
    }

    fn num_rows(&self) -> usize {
        self.input_ids.len()
    }

    /// Last token only once a cache exists, else the full history.
    fn decoder_input_ids(&self, device: &Device) -> candle_core::Result<Tensor> {
        let rows = self.num_rows();
        if self.cache.is_some() {
            let last: Vec<u32> = self
                .input_ids
                .iter()
                .map(|h| h.last().copied().unwrap_or_default())
                .collect();
            Tensor::from_vec(last, (rows, 1), device)
        } else {
            let len = self.input_ids.first().map_or(0, Vec::len);
            let flat: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
            Tensor::from_vec(flat, (rows, len), device)
        }
    }

    /// Global rows of diversity group `group_idx`, example-major.
    fn group_rows(&self, group_idx: usize) -> Vec<usize> {
        (0..self.batch_size)
            .flat_map(|batch_idx| {
                let start = batch_idx * self.num_beams + group_idx * self.group_size;
                start..start + self.group_size
            })
            .collect()
    }

    /// Advance every group by one token.
    fn step(
        &mut self,
        params: &GenerationParams,
        processors: &LogitsProcessorList,
        beam_scorer: &mut BeamSearchScorer,
        mut next_token_scores: Vec<Vec<f32>>,
    ) -> Result<()> {
        let num_rows = self.num_rows();
        let mut current_tokens = vec![0u32; num_rows];
        let mut parents: Vec<usize> = (0..num_rows).collect();
        let mut next_beam_scores = vec![0.0f32; num_rows];
        let mut processed = self.record_scores.then(|| vec![Vec::new(); num_rows]);

        for group_idx in 0..self.num_beam_groups {
            let rows = self.group_rows(group_idx);
            let group_ids: Cow<'_, [Vec<u32>]> = if self.num_beam_groups == 1 {
                Cow::Borrowed(&self.input_ids)
            } else {
                Cow::Owned(rows.iter().map(|&r| self.input_ids[r].clone()).collect())
            };
            let mut group_scores: Vec<Vec<f32>> = rows
                .iter()
                .map(|&r| std::mem::take(&mut next_token_scores[r]))
                .collect();

            if self.num_beam_groups == 1 {
                processors.process(&group_ids, &mut group_scores);
            } else {
                processors.process_group(
                    &group_ids,
                    &mut group_scores,
                    &GroupContext {
                        current_tokens: &current_tokens,
                        group_index: group_idx,
                    },
                );
            }

            for (i, row_scores) in group_scores.iter_mut().enumerate() {
                let row = rows[i];
                if let Some((token, &value)) = row_scores
                    .iter()
                    .enumerate()
                    .find(|(_, v)| v.is_nan() || **v == f32::INFINITY)
                {
                    return Err(GenerationError::NonFiniteScore {
                        step: self.step,
                        beam: row,
                        token,
                        value,
                    });
                }
                if let Some(processed) = processed.as_mut() {
                    processed[row] = row_scores.clone();
                }
                let beam_score = self.beam_scores[row];
                for score in row_scores.iter_mut() {
                    *score += beam_score;
                }
            }

            let candidates = select_top_candidates(&group_scores, self.group_size);
            let out = beam_scorer.process(
                &group_ids,
                &candidates,
                params.pad_token_id,
                params.eos_token_id,
                group_idx,
                self.lineage.as_deref(),
            )?;

            for (i, &row) in rows.iter().enumerate() {
                next_beam_scores[row] = out.next_beam_scores[i];
                current_tokens[row] = out.next_beam_tokens[i];
                parents[row] = rows[out.next_beam_indices[i]];
            }
        }

        self.input_ids = parents
            .iter()
            .zip(&current_tokens)
            .map(|(&parent, &token)| {
                let mut history = self.input_ids[parent].clone();
                history.push(token);
                history
            })
            .collect();
        if let Some(lineage) = self.lineage.as_mut() {
            *lineage = parents
                .iter()
                .map(|&parent| {
                    let mut path = lineage[parent].clone();
                    path.push(parent);
                    path
                })
                .collect();
        }
        if let Some(processed) = processed {
            self.scores.push(processed);
        }
        self.beam_scores = next_beam_scores;
        self.last_parents = parents;
        self.cur_len += 1;
        self.step += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationOverrides;

    fn params(num_beams: usize, num_beam_groups: usize) -> GenerationParams {
        let config = GenerationConfig {
            eos_token_id: Some(2),
            pad_token_id: Some(1),
            ..Default::default()
        };
        let overrides = GenerationOverrides {
            num_beams: Some(num_beams),
            num_beam_groups: Some(num_beam_groups),
            ..Default::default()
        };
        GenerationParams::resolve(&config, &overrides, 0, true).unwrap()
    }

    #[test]
    fn initial_scores_keep_one_live_beam_per_group() {
        let state = SearchState::new(&params(4, 1), 2);
        assert_eq!(
            state.beam_scores,
            vec![0.0, -1e9, -1e9, -1e9, 0.0, -1e9, -1e9, -1e9]
        );

        let state = SearchState::new(&params(4, 2), 1);
        assert_eq!(state.beam_scores, vec![0.0, -1e9, 0.0, -1e9]);
    }

    #[test]
    fn group_rows_are_example_major() {
        let state = SearchState::new(&params(4, 2), 2);
        assert_eq!(state.group_rows(0), vec![0, 1, 4, 5]);
        assert_eq!(state.group_rows(1), vec![2, 3, 6, 7]);
    }

    #[test]
    fn decoder_input_is_full_history_without_cache() {
        let mut state = SearchState::new(&params(2, 1), 1);
        state.input_ids = vec![vec![0, 5, 6], vec![0, 7, 8]];
        let ids = state.decoder_input_ids(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 3]);

        state.cache = Some(DecoderCache::default());
        let ids = state.decoder_input_ids(&Device::Cpu).unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![6], vec![8]]);
    }

    #[test]
    fn step_appends_and_reorders() {
        let p = params(2, 1);
        let mut state = SearchState::new(&p, 1);
        let mut scorer = BeamSearchScorer::new(1, 2, 1, 1.0, false, 1);
        let processors = LogitsProcessorList::new();

        // beam 1 starts at -1e9, so both survivors descend from beam 0
        let scores = vec![vec![-3.0, -0.5, -4.0, -1.0], vec![-0.1, -0.1, -0.1, -0.1]];
        state.step(&p, &processors, &mut scorer, scores).unwrap();

        assert_eq!(state.input_ids, vec![vec![0, 1], vec![0, 3]]);
        assert_eq!(state.last_parents, vec![0, 0]);
        assert_eq!(state.beam_scores, vec![-0.5, -1.0]);
        assert_eq!(state.cur_len, 2);
    }

    #[test]
    fn step_rejects_nan_scores() {
        let p = params(1, 1);
        let mut state = SearchState::new(&p, 1);
        let mut scorer = BeamSearchScorer::new(1, 1, 1, 1.0, false, 1);
        let err = state
            .step(
                &p,
                &LogitsProcessorList::new(),
                &mut scorer,
                vec![vec![-1.0, f32::NAN, -2.0]],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::NonFiniteScore {
                step: 0,
                beam: 0,
                token: 1,
                ..
            }
        ));
    }
}
