//! Bounded experience store with uniform replay sampling.

use ndarray::Array1;
use rand::seq::index::sample;
use rand::Rng;
use std::collections::VecDeque;

use crate::env::TradeAction;
use crate::error::{Result, TradingError};

/// One step of interaction, recorded exactly as the environment emitted it.
/// Observations are indexed by agent ordinal. Never mutated after insertion.
#[derive(Debug, Clone)]
pub struct Transition {
    pub global_state: Array1<f64>,
    pub observations: Vec<Array1<f64>>,
    pub actions: Vec<TradeAction>,
    pub reward: f64,
    pub next_global_state: Array1<f64>,
    pub next_observations: Vec<Array1<f64>>,
    pub done: bool,
}

/// Fixed-capacity FIFO ring over [`Transition`]s.
#[derive(Debug)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay capacity must be positive");
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// O(1) amortized; evicts the oldest entry once full.
    pub fn add(&mut self, transition: Transition) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    /// Uniform random draw without replacement within one call.
    ///
    /// Asking for more than is stored is a caller bug, reported distinctly
    /// so training loops can gate on [`len`](Self::len) instead.
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Vec<&Transition>> {
        if batch_size > self.buffer.len() {
            return Err(TradingError::NotEnoughSamples {
                requested: batch_size,
                available: self.buffer.len(),
            });
        }
        Ok(sample(rng, self.buffer.len(), batch_size)
            .into_iter()
            .map(|i| &self.buffer[i])
            .collect())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
