use std::num::NonZeroUsize;

use super::{CombinationPolicy, accumulate, momentum_step};
use crate::Result;

/// Plain summation of deltas followed by a momentum and weight decay step
/// at a fixed learning rate.
#[derive(Debug, Clone)]
pub struct MomentumPolicy {
    learning_rate: f32,
    momentum: f32,
    decay: f32,
    merged: usize,
}

impl MomentumPolicy {
    /// Creates a new `MomentumPolicy`.
    ///
    /// # Arguments
    /// * `learning_rate` - The step size.
    /// * `momentum` - How much of the previous velocity survives each step.
    /// * `decay` - The weight decay coefficient.
    pub fn new(learning_rate: f32, momentum: f32, decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            decay,
            merged: 0,
        }
    }
}

impl CombinationPolicy for MomentumPolicy {
    fn merge(&mut self, delta: &[f32], acc: &mut [f32]) {
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
        momentum_step(
            weights,
            momentum,
            grads,
            self.momentum,
            self.decay,
            self.learning_rate,
            batch_size.get(),
        )
    }

    fn merged(&self) -> usize {
        self.merged
    }
}
