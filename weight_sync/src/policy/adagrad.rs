use std::num::NonZeroUsize;

use log::trace;

use super::{CombinationPolicy, accumulate, momentum_step};
use crate::{Result, SyncErr};

/// Sums deltas like `MomentumPolicy` but scales the learning rate by the
/// inverse square root of every gradient magnitude seen so far.
///
/// Both local deltas (through `pre_send`) and merged remote ones count
/// towards the magnitude. It's never reset, so the rate only shrinks for
/// the whole run.
#[derive(Debug, Clone)]
pub struct AdaGradPolicy {
    learning_rate: f32,
    momentum: f32,
    decay: f32,
    magnitude: f64,
    merged: usize,
}

impl AdaGradPolicy {
    /// Creates a new `AdaGradPolicy`.
    ///
    /// # Arguments
    /// * `learning_rate` - The base step size, before scaling.
    /// * `momentum` - How much of the previous velocity survives each step.
    /// * `decay` - The weight decay coefficient.
    pub fn new(learning_rate: f32, momentum: f32, decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            decay,
            magnitude: 0.,
            merged: 0,
        }
    }

    /// The accumulated squared L2 magnitude.
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    fn observe(&mut self, delta: &[f32]) {
        self.magnitude += delta.iter().map(|&d| (d as f64) * (d as f64)).sum::<f64>();
    }

    /// The learning rate scaled by the accumulated magnitude.
    ///
    /// # Returns
    /// An `InvalidMagnitude` error if the magnitude isn't strictly positive and finite.
    fn rate(&self) -> Result<f32> {
        let magnitude = self.magnitude;
        if !magnitude.is_finite() || magnitude <= 0. {
            return Err(SyncErr::InvalidMagnitude { magnitude });
        }

        Ok((self.learning_rate as f64 / magnitude.sqrt()) as f32)
    }
}

impl CombinationPolicy for AdaGradPolicy {
    fn pre_send(&mut self, delta: &[f32]) {
        self.observe(delta);
    }

    fn merge(&mut self, delta: &[f32], acc: &mut [f32]) {
        self.observe(delta);
        accumulate(delta, acc);
        self.merged += 1;
    }

    fn apply(
        &mut self,
        weights: &mut [f32],
        momentum: &mut [f32],
        grads: &[f32],
        batch_size: NonZeroUsize,
    ) -> Result<()> {
        let rate = self.rate()?;
        trace!(rate = rate, magnitude = self.magnitude; "adaptive step");

        momentum_step(
            weights,
            momentum,
            grads,
            self.momentum,
            self.decay,
            rate,
            batch_size.get(),
        )
    }

    fn merged(&self) -> usize {
        self.merged
    }
}
