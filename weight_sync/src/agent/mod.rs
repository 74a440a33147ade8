mod builder;
mod control;
mod sync_agent;

pub use builder::AgentBuilder;
pub use sync_agent::SynchronizationAgent;

use crate::SyncErr;

/// Called with the error that stopped the background loop.
pub(crate) type FatalHook = Box<dyn Fn(&SyncErr) + Send + Sync>;

/// Binds the background thread to the node's device before its first pass.
pub(crate) type BindContext = Box<dyn FnOnce() + Send>;
