//! Stopping criteria for the decoding loop.
//!
//! Criteria are OR-combined: generation stops as soon as any of them fires.

use std::time::{Duration, Instant};

use crate::config::GenerationParams;
use crate::error::ConfigError;

pub trait StoppingCriteria: Send + Sync {
    /// `input_ids` holds the full history of every beam row.
    fn is_done(&self, input_ids: &[Vec<u32>], scores: Option<&[Vec<f32>]>) -> bool;

    /// Stable tag used to detect duplicate registrations.
    fn name(&self) -> &'static str;

    /// The length bound this criterion enforces, if any.
    fn max_length(&self) -> Option<usize> {
        None
    }
}

/// Stops once the history reaches `max_length` tokens.
pub struct MaxLengthCriteria {
    max_length: usize,
}

impl MaxLengthCriteria {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl StoppingCriteria for MaxLengthCriteria {
    fn is_done(&self, input_ids: &[Vec<u32>], _scores: Option<&[Vec<f32>]>) -> bool {
        input_ids.first().map_or(0, Vec::len) >= self.max_length
    }

    fn name(&self) -> &'static str {
        "max_length"
    }

    fn max_length(&self) -> Option<usize> {
        Some(self.max_length)
    }
}

/// Stops once the wall-clock budget since construction is spent.
pub struct MaxTimeCriteria {
    max_time: Duration,
    initial_timestamp: Instant,
}

impl MaxTimeCriteria {
    pub fn new(max_time: Duration) -> Self {
        Self::starting_at(max_time, Instant::now())
    }

    pub fn starting_at(max_time: Duration, initial_timestamp: Instant) -> Self {
        Self {
            max_time,
            initial_timestamp,
        }
    }
}

impl StoppingCriteria for MaxTimeCriteria {
    fn is_done(&self, _input_ids: &[Vec<u32>], _scores: Option<&[Vec<f32>]>) -> bool {
        self.initial_timestamp.elapsed() > self.max_time
    }

    fn name(&self) -> &'static str {
        "max_time"
    }
}

#[derive(Default)]
pub struct StoppingCriteriaList {
    criteria: Vec<Box<dyn StoppingCriteria>>,
}

impl StoppingCriteriaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, criterion: Box<dyn StoppingCriteria>) {
        self.criteria.push(criterion);
    }

    /// True when any criterion fires.
    pub fn is_done(&self, input_ids: &[Vec<u32>], scores: Option<&[Vec<f32>]>) -> bool {
        self.criteria.iter().any(|c| c.is_done(input_ids, scores))
    }

    /// The first length bound found among the criteria.
    pub fn max_length(&self) -> Option<usize> {
        self.criteria.iter().find_map(|c| c.max_length())
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    /// Build the default criteria from resolved parameters and merge `custom`.
    ///
    /// The resulting list must be non-empty and carry a length bound.
    pub fn from_params(
        params: &GenerationParams,
        custom: Vec<Box<dyn StoppingCriteria>>,
    ) -> Result<Self, ConfigError> {
        let mut list = Self::new();
        list.push(Box::new(MaxLengthCriteria::new(params.max_length)));
        if let Some(max_time) = params.max_time {
            let limit = Duration::try_from_secs_f64(max_time)
                .ok()
                .filter(|limit| !limit.is_zero())
                .ok_or(ConfigError::InvalidMaxTime(max_time))?;
            list.push(Box::new(MaxTimeCriteria::new(limit)));
        }

        for criterion in custom {
            let name = criterion.name();
            if list.criteria.iter().any(|c| c.name() == name) {
                return Err(ConfigError::DuplicateCriterion { name });
            }
            list.push(criterion);
        }

        list.validate()?;
        Ok(list)
    }

    /// Beam search needs a terminating length bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::NoStoppingCriteria);
        }
        if self.max_length().is_none() {
            return Err(ConfigError::MissingMaxLength);
        }
        Ok(())
    }
}
