//! Score-transform rules.
//!
//! Every rule rewrites a `[rows][vocab]` matrix of log-probabilities given the
//! token history of each row. Rules derive everything they need from the
//! history passed in; none of them keeps state between calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::ngram::{banned_repeat_tokens, banned_tokens, ngram_table};
use super::{GroupContext, LogitsProcessor};
use crate::error::ConfigError;

/// Current decoder length (all rows share it).
fn cur_len(input_ids: &[Vec<u32>]) -> usize {
    input_ids.first().map_or(0, Vec::len)
}

fn ban(row: &mut [f32], token_id: u32) {
    if let Some(score) = row.get_mut(token_id as usize) {
        *score = f32::NEG_INFINITY;
    }
}

/// Leave `token_id` as the only finite entry of `row`, at log-prob 0.
fn force(row: &mut [f32], token_id: u32) {
    row.fill(f32::NEG_INFINITY);
    if let Some(score) = row.get_mut(token_id as usize) {
        *score = 0.0;
    }
}

/// Repetition penalty processor (CTRL-style).
///
/// Every distinct token already in the row's history has its score divided
/// by the penalty when positive, multiplied when zero or negative.
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for (history, row) in input_ids.iter().zip(scores.iter_mut()) {
            let seen: HashSet<u32> = history.iter().copied().collect();
            for token_id in seen {
                if let Some(score) = row.get_mut(token_id as usize) {
                    if *score > 0.0 {
                        *score /= self.penalty;
                    } else {
                        *score *= self.penalty;
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Forbids any token that would recreate an n-gram already in the row's history.
pub struct NoRepeatNGramProcessor {
    ngram_size: usize,
}

impl NoRepeatNGramProcessor {
    pub fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }
}

impl LogitsProcessor for NoRepeatNGramProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for (history, row) in input_ids.iter().zip(scores.iter_mut()) {
            for token_id in banned_repeat_tokens(history, self.ngram_size) {
                ban(row, token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}

/// Forbids any token that would copy an n-gram from the row's source sequence.
///
/// Row `i` belongs to example `i / (rows / examples)`.
pub struct EncoderNoRepeatNGramProcessor {
    ngram_size: usize,
    encoder_input_ids: Vec<Vec<u32>>,
}

impl EncoderNoRepeatNGramProcessor {
    pub fn new(ngram_size: usize, encoder_input_ids: Vec<Vec<u32>>) -> Self {
        Self {
            ngram_size,
            encoder_input_ids,
        }
    }
}

impl LogitsProcessor for EncoderNoRepeatNGramProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        let batch_size = self.encoder_input_ids.len();
        if batch_size == 0 || input_ids.is_empty() {
            return;
        }
        let rows_per_example = (input_ids.len() / batch_size).max(1);
        let tables: Vec<_> = self
            .encoder_input_ids
            .iter()
            .map(|source| ngram_table(source, self.ngram_size))
            .collect();

        for (row_idx, (history, row)) in input_ids.iter().zip(scores.iter_mut()).enumerate() {
            let Some(table) = tables.get(row_idx / rows_per_example) else {
                continue;
            };
            for token_id in banned_tokens(table, history, self.ngram_size) {
                ban(row, token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "encoder_no_repeat_ngram"
    }
}

/// Bad-words (multi-token sequence) processor.
///
/// - Single-token words: unconditionally set to -inf
/// - Multi-token words: only ban the last token when the history ends with
///   the word's prefix
///
/// A bad word equal to `[eos]` is dropped so generation can always finish.
/// An empty word is rejected.
pub struct NoBadWordsProcessor {
    bad_words_ids: Vec<Vec<u32>>,
}

impl NoBadWordsProcessor {
    pub fn new(bad_words_ids: Vec<Vec<u32>>, eos_token_id: u32) -> Result<Self, ConfigError> {
        if let Some(index) = bad_words_ids.iter().position(Vec::is_empty) {
            return Err(ConfigError::EmptyBadWord { index });
        }
        let bad_words_ids = bad_words_ids
            .into_iter()
            .filter(|word| word.as_slice() != [eos_token_id])
            .collect();
        Ok(Self { bad_words_ids })
    }
}

impl LogitsProcessor for NoBadWordsProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for (history, row) in input_ids.iter().zip(scores.iter_mut()) {
            for word_ids in &self.bad_words_ids {
                let Some((&last_token, prefix)) = word_ids.split_last() else {
                    continue;
                };
                if prefix.len() > history.len() {
                    continue;
                }
                if history.ends_with(prefix) {
                    ban(row, last_token);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "no_bad_words"
    }
}

/// Min-length processor: prevents EOS until the history reaches `min_length`.
pub struct MinLengthProcessor {
    min_length: usize,
    eos_token_id: u32,
}

impl MinLengthProcessor {
    pub fn new(min_length: usize, eos_token_id: u32) -> Self {
        Self {
            min_length,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for MinLengthProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        if cur_len(input_ids) < self.min_length {
            for row in scores.iter_mut() {
                ban(row, self.eos_token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Callback deciding the allowed continuations of `(example_idx, history)`.
pub type PrefixAllowedTokensFn = Arc<dyn Fn(usize, &[u32]) -> Vec<u32> + Send + Sync>;

/// Restricts each row to the tokens its callback allows.
pub struct PrefixConstrainedProcessor {
    allowed_tokens: PrefixAllowedTokensFn,
    rows_per_example: usize,
}

impl PrefixConstrainedProcessor {
    pub fn new(allowed_tokens: PrefixAllowedTokensFn, rows_per_example: usize) -> Self {
        Self {
            allowed_tokens,
            rows_per_example: rows_per_example.max(1),
        }
    }
}

impl LogitsProcessor for PrefixConstrainedProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for (row_idx, (history, row)) in input_ids.iter().zip(scores.iter_mut()).enumerate() {
            let allowed = (self.allowed_tokens)(row_idx / self.rows_per_example, history);
            let mut masked = vec![f32::NEG_INFINITY; row.len()];
            for token_id in allowed {
                let idx = token_id as usize;
                if idx < row.len() {
                    masked[idx] = row[idx];
                }
            }
            *row = masked;
        }
    }

    fn name(&self) -> &'static str {
        "prefix_constrained"
    }
}

/// Forces `bos_token_id` as the first generated token.
pub struct ForcedBosProcessor {
    bos_token_id: u32,
}

impl ForcedBosProcessor {
    pub fn new(bos_token_id: u32) -> Self {
        Self { bos_token_id }
    }
}

impl LogitsProcessor for ForcedBosProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        if cur_len(input_ids) == 1 {
            for row in scores.iter_mut() {
                force(row, self.bos_token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "forced_bos"
    }
}

/// Forces `eos_token_id` as the last token when `max_length` is reached.
pub struct ForcedEosProcessor {
    max_length: usize,
    eos_token_id: u32,
}

impl ForcedEosProcessor {
    pub fn new(max_length: usize, eos_token_id: u32) -> Self {
        Self {
            max_length,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for ForcedEosProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        if cur_len(input_ids) + 1 == self.max_length {
            for row in scores.iter_mut() {
                force(row, self.eos_token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "forced_eos"
    }
}

/// Replaces NaN with 0 and +inf with the largest finite value.
///
/// -inf is the masking sentinel and is left alone.
pub struct InfNanRemoveProcessor;

impl LogitsProcessor for InfNanRemoveProcessor {
    fn process(&self, _input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for score in scores.iter_mut().flat_map(|row| row.iter_mut()) {
            if score.is_nan() {
                *score = 0.0;
            } else if *score == f32::INFINITY {
                *score = f32::MAX;
            }
        }
    }

    fn name(&self) -> &'static str {
        "inf_nan_remove"
    }
}

/// Scales the EOS score by `factor^(cur_len - start)` once `cur_len > start`.
pub struct ExponentialDecayLengthPenalty {
    regulation_start: usize,
    regulation_factor: f32,
    eos_token_id: u32,
}

impl ExponentialDecayLengthPenalty {
    /// `start_index` counts generated tokens; `input_len` is the decoder prompt length.
    pub fn new(start_index: usize, decay_factor: f32, eos_token_id: u32, input_len: usize) -> Self {
        Self {
            regulation_start: start_index + input_len,
            regulation_factor: decay_factor,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for ExponentialDecayLengthPenalty {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        let cur_len = cur_len(input_ids);
        if cur_len <= self.regulation_start {
            return;
        }
        let exponent = (cur_len - self.regulation_start) as i32;
        let scale = self.regulation_factor.powi(exponent);
        for row in scores.iter_mut() {
            if let Some(score) = row.get_mut(self.eos_token_id as usize) {
                *score *= scale;
            }
        }
    }

    fn name(&self) -> &'static str {
        "exponential_decay_length_penalty"
    }
}

/// Suppresses a fixed set of tokens at every step.
pub struct SuppressTokensProcessor {
    suppress_tokens: Vec<u32>,
}

impl SuppressTokensProcessor {
    pub fn new(suppress_tokens: Vec<u32>) -> Self {
        Self { suppress_tokens }
    }
}

impl LogitsProcessor for SuppressTokensProcessor {
    fn process(&self, _input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for row in scores.iter_mut() {
            for &token_id in &self.suppress_tokens {
                ban(row, token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "suppress_tokens"
    }
}

/// Suppresses a set of tokens only at the step where generation begins.
pub struct SuppressTokensAtBeginProcessor {
    begin_suppress_tokens: Vec<u32>,
    begin_index: usize,
}

impl SuppressTokensAtBeginProcessor {
    pub fn new(begin_suppress_tokens: Vec<u32>, begin_index: usize) -> Self {
        Self {
            begin_suppress_tokens,
            begin_index,
        }
    }
}

impl LogitsProcessor for SuppressTokensAtBeginProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        if cur_len(input_ids) != self.begin_index {
            return;
        }
        for row in scores.iter_mut() {
            for &token_id in &self.begin_suppress_tokens {
                ban(row, token_id);
            }
        }
    }

    fn name(&self) -> &'static str {
        "suppress_tokens_at_begin"
    }
}

/// Forces specific tokens at specific generation indices.
pub struct ForceTokensProcessor {
    force_token_map: HashMap<usize, u32>,
}

impl ForceTokensProcessor {
    pub fn new(forced_decoder_ids: &[(usize, u32)]) -> Self {
        Self {
            force_token_map: forced_decoder_ids.iter().copied().collect(),
        }
    }
}

impl LogitsProcessor for ForceTokensProcessor {
    fn process(&self, input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        let Some(&token_id) = self.force_token_map.get(&cur_len(input_ids)) else {
            return;
        };
        for row in scores.iter_mut() {
            force(row, token_id);
        }
    }

    fn name(&self) -> &'static str {
        "force_tokens"
    }
}

/// Hamming diversity penalty for diverse (grouped) beam search.
///
/// Tokens picked at this step by earlier groups of the same example are
/// penalized by `diversity_penalty` per occurrence.
pub struct HammingDiversityProcessor {
    diversity_penalty: f32,
    num_beams: usize,
    num_sub_beams: usize,
}

impl HammingDiversityProcessor {
    pub fn new(diversity_penalty: f32, num_beams: usize, num_beam_groups: usize) -> Self {
        Self {
            diversity_penalty,
            num_beams,
            num_sub_beams: num_beams / num_beam_groups.max(1),
        }
    }
}

impl LogitsProcessor for HammingDiversityProcessor {
    /// Without group information there are no earlier groups to diverge from.
    fn process(&self, _input_ids: &[Vec<u32>], _scores: &mut [Vec<f32>]) {}

    fn process_group(
        &self,
        _input_ids: &[Vec<u32>],
        scores: &mut [Vec<f32>],
        group: &GroupContext<'_>,
    ) {
        let group_start = group.group_index * self.num_sub_beams;
        if group_start == 0 || self.num_beams == 0 {
            return;
        }
        let group_size = (group_start + self.num_sub_beams).min(self.num_beams) - group_start;
        let batch_size = group.current_tokens.len() / self.num_beams;

        for batch_idx in 0..batch_size {
            let example_start = batch_idx * self.num_beams;
            let previous = &group.current_tokens[example_start..example_start + group_start];
            let mut frequency: HashMap<u32, usize> = HashMap::new();
            for &token_id in previous {
                *frequency.entry(token_id).or_insert(0) += 1;
            }
            let rows = batch_idx * group_size..(batch_idx + 1) * group_size;
            for row in scores[rows].iter_mut() {
                for (&token_id, &count) in &frequency {
                    if let Some(score) = row.get_mut(token_id as usize) {
                        *score -= self.diversity_penalty * count as f32;
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "hamming_diversity"
    }
}

/// Re-applies log-softmax to every row so masked scores stay a distribution.
pub struct LogitNormalization;

impl LogitsProcessor for LogitNormalization {
    fn process(&self, _input_ids: &[Vec<u32>], scores: &mut [Vec<f32>]) {
        for row in scores.iter_mut() {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum_exp = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
            for score in row.iter_mut() {
                *score = *score - max - log_sum_exp;
            }
        }
    }

    fn name(&self) -> &'static str {
        "logit_normalization"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize, row: &[f32]) -> Vec<Vec<f32>> {
        vec![row.to_vec(); n]
    }

    #[test]
    fn repetition_penalty_is_asymmetric() {
        let proc = RepetitionPenaltyProcessor::new(2.0);
        let mut scores = vec![vec![1.0, 2.0, -1.0, 0.5]];
        // Token 0 appears twice; the penalty still applies once.
        proc.process(&[vec![0, 2, 0]], &mut scores);

        assert!((scores[0][0] - 0.5).abs() < 1e-6);
        assert!((scores[0][1] - 2.0).abs() < 1e-6);
        assert!((scores[0][2] - (-2.0)).abs() < 1e-6);
        assert!((scores[0][3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn no_repeat_ngram_masks_seen_bigram_continuation() {
        let proc = NoRepeatNGramProcessor::new(2);
        let mut scores = rows(1, &[-1.0; 12]);
        proc.process(&[vec![5, 9, 5, 9]], &mut scores);

        // Seen bigrams {(5,9), (9,5)}; the history ends with 9, so only
        // (9,5) can be recreated.
        for (token, &score) in scores[0].iter().enumerate() {
            if token == 5 {
                assert_eq!(score, f32::NEG_INFINITY);
            } else {
                assert_eq!(score, -1.0, "token {token} should be untouched");
            }
        }
    }

    #[test]
    fn no_repeat_ngram_is_per_row() {
        let proc = NoRepeatNGramProcessor::new(2);
        let mut scores = rows(2, &[0.0; 4]);
        proc.process(&[vec![1, 2, 1], vec![3, 3, 0]], &mut scores);
        assert_eq!(scores[0][2], f32::NEG_INFINITY);
        assert_eq!(scores[0][3], 0.0);
        // Row 1 ends with 0, which never started a bigram.
        assert!(scores[1].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn encoder_no_repeat_ngram_uses_example_source() {
        let proc = EncoderNoRepeatNGramProcessor::new(2, vec![vec![1, 2], vec![1, 3]]);
        // Two examples, two beams each; every beam just produced token 1.
        let input_ids = vec![vec![0, 1]; 4];
        let mut scores = rows(4, &[0.0; 5]);
        proc.process(&input_ids, &mut scores);

        assert_eq!(scores[0][2], f32::NEG_INFINITY);
        assert_eq!(scores[1][2], f32::NEG_INFINITY);
        assert_eq!(scores[0][3], 0.0);
        assert_eq!(scores[2][3], f32::NEG_INFINITY);
        assert_eq!(scores[3][3], f32::NEG_INFINITY);
        assert_eq!(scores[2][2], 0.0);
    }

    #[test]
    fn no_bad_words_single_and_multi_token() {
        let proc = NoBadWordsProcessor::new(vec![vec![1], vec![2, 3]], 9).unwrap();
        let mut scores = rows(2, &[5.0; 5]);
        proc.process(&[vec![0, 2], vec![0, 4]], &mut scores);

        assert_eq!(scores[0][1], f32::NEG_INFINITY);
        assert_eq!(scores[0][3], f32::NEG_INFINITY);
        assert_eq!(scores[1][1], f32::NEG_INFINITY);
        assert_eq!(scores[1][3], 5.0);
        assert_eq!(scores[0][4], 5.0);
    }

    #[test]
    fn no_bad_words_drops_eos_word() {
        let proc = NoBadWordsProcessor::new(vec![vec![2]], 2).unwrap();
        let mut scores = rows(1, &[1.0; 3]);
        proc.process(&[vec![0]], &mut scores);
        assert_eq!(scores[0][2], 1.0);
    }

    #[test]
    fn no_bad_words_rejects_empty_word() {
        let err = NoBadWordsProcessor::new(vec![vec![4], vec![]], 2).err().unwrap();
        assert_eq!(err, ConfigError::EmptyBadWord { index: 1 });
    }

    #[test]
    fn min_length_blocks_eos_below_minimum_only() {
        let proc = MinLengthProcessor::new(5, 2);
        for len in 1..8 {
            let mut scores = rows(3, &[-0.5; 4]);
            proc.process(&vec![vec![7; len]; 3], &mut scores);
            for row in &scores {
                if len < 5 {
                    assert_eq!(row[2], f32::NEG_INFINITY, "len {len}");
                } else {
                    assert_eq!(row[2], -0.5, "len {len}");
                }
                assert_eq!(row[1], -0.5);
            }
        }
    }

    #[test]
    fn prefix_constrained_keeps_allowed_scores() {
        let allowed: PrefixAllowedTokensFn =
            Arc::new(|example, _history| if example == 0 { vec![1] } else { vec![2, 3, 99] });
        let proc = PrefixConstrainedProcessor::new(allowed, 2);
        let mut scores = rows(4, &[-1.0, -2.0, -3.0, -4.0]);
        proc.process(&vec![vec![0]; 4], &mut scores);

        assert_eq!(scores[0], vec![f32::NEG_INFINITY, -2.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(scores[1], scores[0]);
        assert_eq!(scores[2], vec![f32::NEG_INFINITY, f32::NEG_INFINITY, -3.0, -4.0]);
    }

    #[test]
    fn forced_bos_only_on_first_step() {
        let proc = ForcedBosProcessor::new(3);
        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0]], &mut scores);
        assert_eq!(scores[0][3], 0.0);
        assert_eq!(scores[0].iter().filter(|s| s.is_finite()).count(), 1);

        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0, 3]], &mut scores);
        assert!(scores[0].iter().all(|&s| s == -1.0));
    }

    #[test]
    fn forced_eos_one_step_before_max_length() {
        let proc = ForcedEosProcessor::new(4, 2);
        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0, 1, 1]], &mut scores);
        assert_eq!(scores[0][2], 0.0);
        assert_eq!(scores[0].iter().filter(|s| s.is_finite()).count(), 1);

        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0, 1]], &mut scores);
        assert!(scores[0].iter().all(|&s| s == -1.0));
    }

    #[test]
    fn inf_nan_remove_keeps_negative_infinity() {
        let mut scores = vec![vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -1.0]];
        InfNanRemoveProcessor.process(&[vec![0]], &mut scores);
        assert_eq!(scores[0], vec![0.0, f32::MAX, f32::NEG_INFINITY, -1.0]);
    }

    #[test]
    fn exponential_decay_scales_eos_after_start() {
        let proc = ExponentialDecayLengthPenalty::new(2, 1.5, 1, 1);
        // regulation_start = 3
        let mut scores = rows(1, &[-1.0, -2.0]);
        proc.process(&[vec![0, 4, 4]], &mut scores);
        assert_eq!(scores[0][1], -2.0);

        let mut scores = rows(1, &[-1.0, -2.0]);
        proc.process(&[vec![0, 4, 4, 4, 4]], &mut scores);
        assert!((scores[0][1] - (-2.0 * 1.5 * 1.5)).abs() < 1e-6);
        assert_eq!(scores[0][0], -1.0);
    }

    #[test]
    fn suppress_tokens_every_step() {
        let proc = SuppressTokensProcessor::new(vec![0, 2, 50]);
        let mut scores = rows(2, &[1.0; 3]);
        proc.process(&[vec![0], vec![0]], &mut scores);
        for row in &scores {
            assert_eq!(row, &vec![f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY]);
        }
    }

    #[test]
    fn suppress_at_begin_only_at_begin_index() {
        let proc = SuppressTokensAtBeginProcessor::new(vec![1], 2);
        let mut scores = rows(1, &[0.0; 3]);
        proc.process(&[vec![0]], &mut scores);
        assert_eq!(scores[0][1], 0.0);
        proc.process(&[vec![0, 5]], &mut scores);
        assert_eq!(scores[0][1], f32::NEG_INFINITY);
    }

    #[test]
    fn force_tokens_at_index() {
        let proc = ForceTokensProcessor::new(&[(1, 4), (3, 2)]);
        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0]], &mut scores);
        assert_eq!(scores[0][4], 0.0);
        assert_eq!(scores[0].iter().filter(|s| s.is_finite()).count(), 1);

        let mut scores = rows(1, &[-1.0; 5]);
        proc.process(&[vec![0, 4]], &mut scores);
        assert!(scores[0].iter().all(|&s| s == -1.0));
    }

    #[test]
    fn hamming_diversity_penalizes_earlier_groups() {
        // One example, 4 beams in 2 groups of 2.
        let proc = HammingDiversityProcessor::new(0.5, 4, 2);
        let current_tokens = [3, 3, 0, 0];
        let mut scores = rows(2, &[0.0; 5]);

        proc.process_group(
            &[vec![0], vec![0]],
            &mut scores,
            &GroupContext {
                current_tokens: &current_tokens,
                group_index: 0,
            },
        );
        assert!(scores.iter().flatten().all(|&s| s == 0.0));

        proc.process_group(
            &[vec![0], vec![0]],
            &mut scores,
            &GroupContext {
                current_tokens: &current_tokens,
                group_index: 1,
            },
        );
        for row in &scores {
            assert!((row[3] - (-1.0)).abs() < 1e-6);
            assert_eq!(row[0], 0.0);
        }
    }

    #[test]
    fn logit_normalization_yields_distribution() {
        let mut scores = vec![vec![1.0, 2.0, f32::NEG_INFINITY, 0.5]];
        LogitNormalization.process(&[vec![0]], &mut scores);
        let total: f32 = scores[0].iter().map(|s| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(scores[0][2], f32::NEG_INFINITY);
    }
}
