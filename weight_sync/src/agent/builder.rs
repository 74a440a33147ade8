use std::{process, sync::Arc, time::Duration};

use comms::Transport;
use log::error;

use super::{BindContext, FatalHook};
use crate::{AgentConfig, SyncErr, SynchronizationAgent};

/// Configures and builds a `SynchronizationAgent`.
///
/// By default the loop polls every millisecond and a fatal error ends the process.
pub struct AgentBuilder {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    on_fatal: Option<FatalHook>,
    bind_context: Option<BindContext>,
}

impl AgentBuilder {
    /// Creates a new `AgentBuilder`.
    ///
    /// # Arguments
    /// * `transport` - The mesh the agent exchanges deltas over.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: AgentConfig::default(),
            on_fatal: None,
            bind_context: None,
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the pause between two passes of the background loop.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Replaces what happens when the background loop hits a fatal error.
    ///
    /// The loop stops servicing channels after calling `hook`.
    pub fn on_fatal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SyncErr) + Send + Sync + 'static,
    {
        self.on_fatal = Some(Box::new(hook));
        self
    }

    /// Runs `bind` on the background thread before its first pass.
    pub fn bind_context<F>(mut self, bind: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.bind_context = Some(Box::new(bind));
        self
    }

    /// Builds the agent, its loop isn't started yet.
    pub fn build(self) -> Arc<SynchronizationAgent> {
        let on_fatal = self
            .on_fatal
            .unwrap_or_else(|| Box::new(exit_on_fatal) as FatalHook);

        Arc::new(SynchronizationAgent::new(
            self.transport,
            self.config,
            on_fatal,
            self.bind_context,
        ))
    }
}

fn exit_on_fatal(err: &SyncErr) {
    error!("aborting after a fatal synchronization error: {err}");
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use comms::LocalTransport;

    use super::*;

    #[test]
    fn context_is_bound_on_the_background_thread() {
        let (tx, rx) = mpsc::channel();

        let agent = AgentBuilder::new(Arc::new(LocalTransport::mesh(1).remove(0)))
            .poll_interval(Duration::from_millis(5))
            .bind_context(move || {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            })
            .build();

        agent.start().unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("weight-sync"));
        agent.shutdown();
    }
}
