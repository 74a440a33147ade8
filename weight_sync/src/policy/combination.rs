use std::{fmt, num::NonZeroUsize};

use crate::Result;

/// Decides how gradient deltas are combined and turned into weight updates.
///
/// Implementations hold no locks, the channel owning the policy serializes
/// every call.
pub trait CombinationPolicy: Send + fmt::Debug {
    /// Observes a local delta right before it's queued for sending.
    ///
    /// # Arguments
    /// * `delta` - The local gradient about to be shared.
    fn pre_send(&mut self, _delta: &[f32]) {}

    /// Adds `delta` into `acc` in place.
    ///
    /// # Arguments
    /// * `delta` - The gradient to fold in.
    /// * `acc` - Where the combined gradient is accumulated.
    fn merge(&mut self, delta: &[f32], acc: &mut [f32]);

    /// Applies one optimization step to `weights`.
    ///
    /// # Arguments
    /// * `weights` - The parameters to update in place.
    /// * `momentum` - The velocity buffer, updated in place.
    /// * `grads` - The (possibly combined) gradient.
    /// * `batch_size` - The amount of samples the gradient was summed over.
    ///
    /// # Returns
    /// An error if the buffers don't line up or the step can't be computed.
    fn apply(
        &mut self,
        weights: &mut [f32],
        momentum: &mut [f32],
        grads: &[f32],
        batch_size: NonZeroUsize,
    ) -> Result<()>;

    /// The amount of deltas merged so far.
    fn merged(&self) -> usize;
}
