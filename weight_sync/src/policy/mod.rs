mod adagrad;
mod combination;
mod momentum;

pub use adagrad::AdaGradPolicy;
pub use combination::CombinationPolicy;
pub use momentum::MomentumPolicy;

use crate::{Result, SyncErr};

/// Runs one momentum and weight decay step over flat buffers.
///
/// `momentum = momentum * mu + grads * (rate / batch) - weights * decay * rate`,
/// then `weights += momentum`.
///
/// # Returns
/// A `LengthMismatch` error if the three buffers differ in length.
pub(crate) fn momentum_step(
    weights: &mut [f32],
    momentum: &mut [f32],
    grads: &[f32],
    mu: f32,
    decay: f32,
    rate: f32,
    batch_size: usize,
) -> Result<()> {
    for (what, got) in [("momentum", momentum.len()), ("gradient", grads.len())] {
        if got != weights.len() {
            return Err(SyncErr::LengthMismatch {
                what,
                expected: weights.len(),
                got,
            });
        }
    }

    let scale = rate / batch_size as f32;
    let shrink = decay * rate;

    weights
        .iter_mut()
        .zip(momentum.iter_mut())
        .zip(grads)
        .for_each(|((w, v), g)| {
            *v = *v * mu + g * scale - *w * shrink;
            *w += *v;
        });

    Ok(())
}

/// Adds `delta` into `acc` element wise.
pub(crate) fn accumulate(delta: &[f32], acc: &mut [f32]) {
    acc.iter_mut().zip(delta).for_each(|(a, d)| *a += d);
}
