//! Bounded set of finished hypotheses for one (example, diversity group) pool.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A single beam hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamHypothesis {
    /// Token history, starting with the decoder start token. EOS is not stored.
    pub token_ids: Vec<u32>,
    /// Cumulative log probability (unnormalized).
    pub score: f32,
    /// Whether this hypothesis has finished (hit EOS).
    pub is_finished: bool,
    /// Row this hypothesis was extended from at its last step.
    pub parent_beam_idx: usize,
    /// Beam row chosen at each step, when lineage is tracked.
    pub beam_indices: Vec<usize>,
}

impl BeamHypothesis {
    /// `score / len^length_penalty`, with `len` the stored history length.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        length_normalized(self.score, self.token_ids.len(), length_penalty)
    }
}

pub(crate) fn length_normalized(sum_logprobs: f32, len: usize, length_penalty: f32) -> f32 {
    sum_logprobs / (len as f32).powf(length_penalty)
}

/// A retained finished hypothesis with its ranking key.
#[derive(Debug, Clone)]
pub struct FinishedHypothesis {
    /// Length-normalized score.
    pub score: f32,
    /// Global admission order; earlier wins ties.
    pub insertion: u64,
    pub hypothesis: BeamHypothesis,
}

impl PartialEq for FinishedHypothesis {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FinishedHypothesis {}

impl PartialOrd for FinishedHypothesis {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FinishedHypothesis {
    /// Greater means worse: lower score, then later admission. The heap top
    /// is therefore the entry to evict.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.insertion.cmp(&other.insertion))
    }
}

/// At most `capacity` finished hypotheses, keyed by length-normalized score.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    capacity: usize,
    length_penalty: f32,
    early_stopping: bool,
    heap: BinaryHeap<FinishedHypothesis>,
}

impl BeamHypotheses {
    pub fn new(capacity: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            capacity,
            length_penalty,
            early_stopping,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Lowest retained normalized score.
    pub fn worst_score(&self) -> Option<f32> {
        self.heap.peek().map(|h| h.score)
    }

    /// Offer a hypothesis. Returns whether it was retained.
    ///
    /// Once full, a candidate must strictly beat the worst retained score;
    /// on a tie the earlier hypothesis stays.
    pub fn add(&mut self, hypothesis: BeamHypothesis, insertion: u64) -> bool {
        let score = hypothesis.normalized_score(self.length_penalty);
        if self.heap.len() >= self.capacity {
            match self.worst_score() {
                Some(worst) if score > worst => {}
                _ => return false,
            }
        }
        self.heap.push(FinishedHypothesis {
            score,
            insertion,
            hypothesis,
        });
        if self.heap.len() > self.capacity {
            self.heap.pop();
        }
        true
    }

    /// Whether no live beam can still displace a retained hypothesis.
    ///
    /// `best_sum_logprobs` is the best cumulative score among this step's
    /// candidates and `cur_len` the current history length.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.heap.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let best_possible = length_normalized(best_sum_logprobs, cur_len, self.length_penalty);
        self.worst_score().is_some_and(|worst| worst >= best_possible)
    }

    /// Retained hypotheses, best first.
    pub fn into_sorted(self) -> Vec<FinishedHypothesis> {
        self.heap.into_sorted_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FinishedHypothesis> {
        self.heap.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(len: usize, score: f32) -> BeamHypothesis {
        BeamHypothesis {
            token_ids: vec![0; len],
            score,
            is_finished: true,
            parent_beam_idx: 0,
            beam_indices: Vec::new(),
        }
    }

    #[test]
    fn length_normalization() {
        let h = hyp(4, -2.0);
        assert!((h.normalized_score(1.0) - (-0.5)).abs() < 1e-6);
        assert!((h.normalized_score(0.0) - (-2.0)).abs() < 1e-6);
        assert!((h.normalized_score(2.0) - (-0.125)).abs() < 1e-6);
    }

    #[test]
    fn length_penalty_reference_ranking() {
        let mut pool = BeamHypotheses::new(3, 1.0, false);
        pool.add(hyp(4, -2.5), 0);
        pool.add(hyp(5, -2.0), 1);
        pool.add(hyp(6, -1.8), 2);

        let ranked: Vec<f32> = pool.into_sorted().iter().map(|h| h.score).collect();
        assert!((ranked[0] - (-0.3)).abs() < 1e-6);
        assert!((ranked[1] - (-0.4)).abs() < 1e-6);
        assert!((ranked[2] - (-0.625)).abs() < 1e-6);
    }

    #[test]
    fn bounded_and_evicts_worst() {
        let mut pool = BeamHypotheses::new(2, 1.0, false);
        assert!(pool.add(hyp(2, -4.0), 0));
        assert!(pool.add(hyp(2, -2.0), 1));
        assert_eq!(pool.worst_score(), Some(-2.0));

        assert!(pool.add(hyp(2, -1.0), 2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.worst_score(), Some(-1.0));

        assert!(!pool.add(hyp(2, -10.0), 3));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn tie_with_worst_keeps_earlier() {
        let mut pool = BeamHypotheses::new(1, 1.0, false);
        assert!(pool.add(hyp(2, -2.0), 0));
        assert!(!pool.add(hyp(2, -2.0), 1));
        let kept = pool.into_sorted();
        assert_eq!(kept[0].insertion, 0);
    }

    #[test]
    fn sorted_ties_by_insertion() {
        let mut pool = BeamHypotheses::new(3, 1.0, false);
        pool.add(hyp(2, -2.0), 7);
        pool.add(hyp(2, -2.0), 3);
        pool.add(hyp(2, -1.0), 9);
        let order: Vec<u64> = pool.into_sorted().iter().map(|h| h.insertion).collect();
        assert_eq!(order, vec![9, 3, 7]);
    }

    #[test]
    fn not_done_until_full() {
        let mut pool = BeamHypotheses::new(2, 1.0, true);
        pool.add(hyp(3, -1.0), 0);
        assert!(!pool.is_done(-100.0, 3));
        pool.add(hyp(3, -1.0), 1);
        // early stopping: full is enough
        assert!(pool.is_done(0.0, 3));
    }

    #[test]
    fn done_when_no_beam_can_improve() {
        let mut pool = BeamHypotheses::new(1, 1.0, false);
        pool.add(hyp(4, -2.0), 0); // -0.5
        // best live beam: -3.0 over 4 tokens = -0.75 < -0.5
        assert!(pool.is_done(-3.0, 4));
        // best live beam: -1.0 over 4 tokens = -0.25 > -0.5
        assert!(!pool.is_done(-1.0, 4));
        // exactly equal counts as done
        assert!(pool.is_done(-2.0, 4));
    }
}
