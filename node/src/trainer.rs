use std::{io, num::NonZeroUsize, sync::Arc};

use log::debug;
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};
use weight_sync::{GroupId, ParameterHandle, SynchronizationAgent};

use crate::spec::NodeSpec;

const INIT_RANGE: f32 = 0.1;
const NOISE: f32 = 0.05;

struct Layer {
    handle: ParameterHandle,
    target: Array2<f32>,
}

/// A stand-in for the compute pipeline: every layer is pulled towards a fixed
/// target by a noisy gradient, so nodes only agree if their deltas flow.
pub struct Trainer {
    layers: Vec<Layer>,
    batch_size: NonZeroUsize,
    rng: StdRng,
}

impl Trainer {
    /// Creates a new `Trainer`, registering one channel per non shared layer.
    ///
    /// # Arguments
    /// * `agent` - The node's synchronization agent.
    /// * `spec` - The node's specification, already validated.
    pub fn new(agent: &Arc<SynchronizationAgent>, spec: &NodeSpec) -> io::Result<Self> {
        let mut layers: Vec<Layer> = Vec::with_capacity(spec.layers.len());

        for (i, layer) in spec.layers.iter().enumerate() {
            let shape = (layer.rows, layer.cols);

            let (handle, target) = match layer.shared_with {
                Some(source) => {
                    let source = layers.get(source).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("layer {i} shares weights with unknown layer {source}"),
                        )
                    })?;

                    (source.handle.mirror(), source.target.clone())
                }
                None => {
                    // Same seed on every node, so they all start from the same weights.
                    let mut init = StdRng::seed_from_u64(spec.seed.wrapping_add(i as u64));
                    let target =
                        Array2::from_shape_simple_fn(shape, || init.random_range(-1.0..1.0));
                    let weights = Array2::from_shape_simple_fn(shape, || {
                        init.random_range(-INIT_RANGE..INIT_RANGE)
                    });

                    let handle = ParameterHandle::new(agent, weights, layer.policy());
                    handle.copy_to_device()?;
                    (handle, target)
                }
            };

            debug!(layer = i, shared = !handle.is_authoritative(); "layer ready");
            layers.push(Layer { handle, target });
        }

        Ok(Self {
            layers,
            batch_size: NonZeroUsize::new(spec.batch_size).unwrap_or(NonZeroUsize::MIN),
            rng: StdRng::seed_from_u64(spec.seed ^ ((spec.rank as u64 + 1) << 32)),
        })
    }

    /// Computes every layer's gradient, then updates every layer.
    ///
    /// Shared layers add their gradient to their source's before it updates.
    ///
    /// # Returns
    /// The squared distance to the targets before the step.
    pub fn step(&mut self) -> io::Result<f32> {
        let scale = self.batch_size.get() as f32;
        let mut loss = 0.;

        for layer in &self.layers {
            let weights = layer.handle.with_weights(|w| w.to_owned())?;
            let diff = &layer.target - &weights;
            loss += diff.iter().map(|d| d * d).sum::<f32>();

            let noise = Array2::from_shape_simple_fn(diff.raw_dim(), || {
                self.rng.random_range(-NOISE..NOISE)
            });
            let grads = diff * scale + noise;

            let authoritative = layer.handle.is_authoritative();
            layer.handle.with_grads(|mut g| {
                if authoritative {
                    g.assign(&grads);
                } else {
                    g.zip_mut_with(&grads, |acc, d| *acc += d);
                }
            })?;

            layer.handle.increment_update_count()?;
        }

        for layer in &self.layers {
            layer.handle.update(self.batch_size)?;
        }

        Ok(loss)
    }

    /// Copies every layer's weights back to the host.
    ///
    /// The agent must be paused so no delta lands halfway through.
    ///
    /// # Returns
    /// The host weights of every layer.
    pub fn checkpoint(&self) -> io::Result<Vec<Array2<f32>>> {
        self.layers
            .iter()
            .map(|layer| {
                layer.handle.copy_to_host()?;
                Ok(layer.handle.host_weights()?)
            })
            .collect()
    }

    /// The channel ids of the layers that own their weights.
    pub fn channels(&self) -> Vec<GroupId> {
        self.layers
            .iter()
            .filter(|layer| layer.handle.is_authoritative())
            .filter_map(|layer| layer.handle.id().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use comms::LocalTransport;

    use super::*;
    use crate::spec::LayerSpec;

    fn layer(epsilon: f32, shared_with: Option<usize>) -> LayerSpec {
        LayerSpec {
            rows: 2,
            cols: 2,
            epsilon,
            momentum: 0.5,
            decay: 0.0,
            adaptive: false,
            shared_with,
        }
    }

    fn spec(layers: Vec<LayerSpec>) -> NodeSpec {
        NodeSpec {
            rank: 0,
            peers: vec!["127.0.0.1:0".parse().unwrap()],
            poll_interval_ms: 1,
            steps: 50,
            batch_size: 4,
            seed: 7,
            layers,
        }
    }

    fn agent() -> Arc<SynchronizationAgent> {
        SynchronizationAgent::builder(Arc::new(LocalTransport::mesh(1).remove(0)))
            .on_fatal(|e| panic!("unexpected fatal error: {e}"))
            .build()
    }

    #[test]
    fn training_reduces_the_loss() {
        let agent = agent();
        let spec = spec(vec![layer(0.1, None), layer(0.1, Some(0))]);
        let mut trainer = Trainer::new(&agent, &spec).unwrap();
        assert_eq!(trainer.channels(), vec![0]);

        let first = trainer.step().unwrap();
        let mut last = first;
        for _ in 0..50 {
            last = trainer.step().unwrap();
        }

        assert!(last < first, "{last} >= {first}");
    }

    #[test]
    fn frozen_layer_keeps_its_weights() {
        let agent = agent();
        let mut trainer = Trainer::new(&agent, &spec(vec![layer(0.0, None)])).unwrap();
        let before = trainer.checkpoint().unwrap();

        for _ in 0..5 {
            trainer.step().unwrap();
        }

        assert_eq!(trainer.checkpoint().unwrap(), before);
    }
}
