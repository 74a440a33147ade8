mod agent;
mod channel;
pub mod config;
mod error;
mod handle;
pub mod policy;
mod transfer;

pub use agent::{AgentBuilder, SynchronizationAgent};
pub use channel::{ChannelStats, ParameterChannel};
pub use config::{AgentConfig, PolicySpec};
pub use error::{Result, SyncErr};
pub use handle::{Coefficients, ParameterHandle};
pub use transfer::{IncomingBuffer, OutgoingBuffer};

/// Identifies one distributed parameter group, doubles as its wire tag.
pub type GroupId = comms::Tag;
