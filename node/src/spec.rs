use std::{fs, io, net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};
use weight_sync::PolicySpec;

const fn default_poll_interval_ms() -> u64 {
    1
}

/// The specification of one trainable tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub rows: usize,
    pub cols: usize,
    /// The learning rate, `0` freezes the layer.
    pub epsilon: f32,
    pub momentum: f32,
    #[serde(default)]
    pub decay: f32,
    /// Scale the rate by the accumulated gradient magnitude.
    #[serde(default)]
    pub adaptive: bool,
    /// Index of an earlier layer whose weights this one reuses.
    #[serde(default)]
    pub shared_with: Option<usize>,
}

impl LayerSpec {
    /// The policy this layer's channel combines deltas with.
    pub fn policy(&self) -> PolicySpec {
        let (learning_rate, momentum, decay) = (self.epsilon, self.momentum, self.decay);

        if self.adaptive {
            PolicySpec::AdaGrad {
                learning_rate,
                momentum,
                decay,
            }
        } else {
            PolicySpec::Momentum {
                learning_rate,
                momentum,
                decay,
            }
        }
    }
}

/// The specification of a training node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub rank: usize,
    /// The listening address of every node, indexed by rank.
    pub peers: Vec<SocketAddr>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub steps: usize,
    pub batch_size: usize,
    /// Seeds the initial weights, every node must use the same one.
    #[serde(default)]
    pub seed: u64,
    pub layers: Vec<LayerSpec>,
}

impl NodeSpec {
    /// Reads and validates a `NodeSpec` from the json file at `path`.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let spec: Self = serde_json::from_str(&raw)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> io::Result<()> {
        let invalid = |msg: String| Err(io::Error::new(io::ErrorKind::InvalidInput, msg));

        if self.rank >= self.peers.len() {
            return invalid(format!(
                "rank {} is out of range for {} peers",
                self.rank,
                self.peers.len()
            ));
        }

        if self.batch_size == 0 {
            return invalid("the batch size must be at least 1".into());
        }

        for (i, layer) in self.layers.iter().enumerate() {
            let Some(source) = layer.shared_with else {
                continue;
            };

            if source >= i {
                return invalid(format!(
                    "layer {i} can only share weights with an earlier layer, not {source}"
                ));
            }

            let shape = |l: &LayerSpec| (l.rows, l.cols);
            if shape(&self.layers[source]) != shape(layer) {
                return invalid(format!("layer {i} and layer {source} differ in shape"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "rank": 1,
        "peers": ["127.0.0.1:7000", "127.0.0.1:7001"],
        "steps": 100,
        "batch_size": 8,
        "layers": [
            { "rows": 4, "cols": 3, "epsilon": 0.1, "momentum": 0.9 },
            { "rows": 4, "cols": 3, "epsilon": 0.1, "momentum": 0.9, "shared_with": 0 },
            { "rows": 1, "cols": 3, "epsilon": 0.5, "momentum": 0.0, "adaptive": true }
        ]
    }"#;

    #[test]
    fn parses_with_defaults() {
        let spec: NodeSpec = serde_json::from_str(SPEC).unwrap();
        spec.validate().unwrap();

        assert_eq!(spec.poll_interval_ms, 1);
        assert_eq!(spec.seed, 0);
        assert_eq!(spec.layers[1].shared_with, Some(0));
        assert!(matches!(spec.layers[0].policy(), PolicySpec::Momentum { .. }));
        assert!(matches!(
            spec.layers[2].policy(),
            PolicySpec::AdaGrad { learning_rate, .. } if learning_rate == 0.5
        ));
    }

    #[test]
    fn forward_sharing_is_rejected() {
        let mut spec: NodeSpec = serde_json::from_str(SPEC).unwrap();
        spec.layers[0].shared_with = Some(1);

        let err = spec.validate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rank_must_have_an_address() {
        let mut spec: NodeSpec = serde_json::from_str(SPEC).unwrap();
        spec.rank = 2;
        assert!(spec.validate().is_err());
    }
}
