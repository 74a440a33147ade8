use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{AdaGradPolicy, CombinationPolicy, MomentumPolicy};

/// The specification for the `CombinationPolicy` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySpec {
    Momentum {
        learning_rate: f32,
        momentum: f32,
        decay: f32,
    },
    #[serde(rename = "adagrad")]
    AdaGrad {
        learning_rate: f32,
        momentum: f32,
        decay: f32,
    },
}

impl PolicySpec {
    /// Builds the policy this spec describes.
    pub fn build(self) -> Box<dyn CombinationPolicy> {
        match self {
            PolicySpec::Momentum {
                learning_rate,
                momentum,
                decay,
            } => Box::new(MomentumPolicy::new(learning_rate, momentum, decay)),
            PolicySpec::AdaGrad {
                learning_rate,
                momentum,
                decay,
            } => Box::new(AdaGradPolicy::new(learning_rate, momentum, decay)),
        }
    }

    /// The `(learning_rate, momentum, decay)` triple, whatever the variant.
    pub fn coefficients(&self) -> (f32, f32, f32) {
        match *self {
            PolicySpec::Momentum {
                learning_rate,
                momentum,
                decay,
            }
            | PolicySpec::AdaGrad {
                learning_rate,
                momentum,
                decay,
            } => (learning_rate, momentum, decay),
        }
    }
}

/// Tunables of the background synchronization loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig {
    /// The pause between two passes over every channel.
    pub poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
        }
    }
}
