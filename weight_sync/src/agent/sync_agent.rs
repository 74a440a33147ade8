use std::{
    fmt, io,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use comms::Transport;
use log::{debug, error, info, trace};
use ndarray::{ArrayView2, ArrayViewMut2};
use parking_lot::{Mutex, RwLock};

use super::{BindContext, FatalHook, control::LoopControl};
use crate::{
    AgentBuilder, AgentConfig, ChannelStats, GroupId, ParameterChannel, Result, SyncErr,
    policy::CombinationPolicy,
};

/// What the compute side and the background loop share.
struct Shared {
    transport: Arc<dyn Transport>,
    channels: RwLock<Vec<Arc<ParameterChannel>>>,
    control: LoopControl,
    config: AgentConfig,
    on_fatal: FatalHook,
    bind_context: Mutex<Option<BindContext>>,
}

/// Keeps every distributed parameter group of this node in sync with its peers.
///
/// Deltas are handed over through `send_and_recv` from the compute thread,
/// a single background thread ships them and folds in whatever the peers
/// send back. Neither side ever waits on the network.
pub struct SynchronizationAgent {
    shared: Arc<Shared>,
    scratch: Mutex<Vec<f32>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SynchronizationAgent {
    /// Creates a new `AgentBuilder` over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> AgentBuilder {
        AgentBuilder::new(transport)
    }

    pub(super) fn new(
        transport: Arc<dyn Transport>,
        config: AgentConfig,
        on_fatal: FatalHook,
        bind_context: Option<BindContext>,
    ) -> Self {
        let shared = Shared {
            transport,
            channels: RwLock::new(Vec::new()),
            control: LoopControl::new(),
            config,
            on_fatal,
            bind_context: Mutex::new(bind_context),
        };

        Self {
            shared: Arc::new(shared),
            scratch: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// This node's rank in the transport's mesh.
    pub fn rank(&self) -> usize {
        self.shared.transport.rank()
    }

    /// Registers a new parameter group.
    ///
    /// # Arguments
    /// * `policy` - How the group's deltas are combined and applied.
    ///
    /// # Returns
    /// The id of the group, ids are handed out sequentially from `0`.
    pub fn register_channel(&self, policy: Box<dyn CombinationPolicy>) -> GroupId {
        let mut channels = self.shared.channels.write();
        let id = channels.len() as GroupId;
        channels.push(Arc::new(ParameterChannel::new(id, policy)));

        debug!(id = id; "registered channel");
        id
    }

    fn channel(&self, id: GroupId) -> Result<Arc<ParameterChannel>> {
        self.shared
            .channels
            .read()
            .get(id as usize)
            .cloned()
            .ok_or(SyncErr::UnknownGroup { id })
    }

    /// Shares a local gradient and applies one optimization step.
    ///
    /// The first call sizes the group after `gradient`. The gradient is queued
    /// for the peers, then if deltas arrived from them they're merged into
    /// it before the step is applied to `weights` and `momentum`.
    ///
    /// # Arguments
    /// * `id` - The parameter group.
    /// * `gradient` - The local gradient.
    /// * `momentum` - The group's velocity, updated in place.
    /// * `weights` - The group's weights, updated in place.
    /// * `batch_size` - The amount of samples the gradient was summed over.
    ///
    /// # Returns
    /// An error if the group is unknown, the tensors disagree in shape or
    /// aren't contiguous, or the step itself fails.
    pub fn send_and_recv(
        &self,
        id: GroupId,
        gradient: ArrayView2<f32>,
        mut momentum: ArrayViewMut2<f32>,
        mut weights: ArrayViewMut2<f32>,
        batch_size: NonZeroUsize,
    ) -> Result<()> {
        let channel = self.channel(id)?;
        let shape = gradient.dim();
        channel.ensure_initialized(shape)?;

        for got in [momentum.dim(), weights.dim()] {
            if got != shape {
                return Err(SyncErr::ShapeMismatch {
                    id,
                    expected: shape,
                    got,
                });
            }
        }

        let grads = gradient.as_slice().ok_or(SyncErr::NonContiguous { id })?;
        let momentum = momentum
            .as_slice_mut()
            .ok_or(SyncErr::NonContiguous { id })?;
        let weights = weights
            .as_slice_mut()
            .ok_or(SyncErr::NonContiguous { id })?;

        channel.enqueue(grads)?;

        let mut scratch = self.scratch.lock();
        channel.drain_and_apply(&mut scratch, grads, momentum, weights, batch_size)
    }

    /// Launches the background loop.
    ///
    /// # Returns
    /// An `AlreadyStarted` error on every call but the first.
    pub fn start(&self) -> Result<()> {
        self.launch(|body| thread::Builder::new().name("weight-sync".into()).spawn(body))
    }

    /// Hands the loop's body to `spawn`. If spawning fails the agent is left
    /// as if it was never started, so `start` can be retried.
    fn launch<S>(&self, spawn: S) -> Result<()>
    where
        S: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SyncErr::AlreadyStarted);
        }

        let shared = Arc::clone(&self.shared);
        self.shared.control.begin();

        match spawn(Box::new(move || shared.run())) {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.control.finish();
                self.started.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Parks the background loop between two passes, returns once it's parked.
    ///
    /// Returns right away if the loop isn't running.
    pub fn pause(&self) {
        self.shared.control.pause();
        debug!("synchronization paused");
    }

    /// Lets a paused loop carry on.
    pub fn resume(&self) {
        self.shared.control.resume();
        debug!("synchronization resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.control.is_paused()
    }

    /// Stops the background loop and waits for it to exit.
    ///
    /// Sends and receives still in flight are abandoned.
    pub fn shutdown(&self) {
        self.shared.control.stop();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        if handle.join().is_err() {
            error!("the synchronization thread panicked");
        }
    }

    /// The transfer counters of a parameter group.
    pub fn stats(&self, id: GroupId) -> Result<ChannelStats> {
        self.channel(id).map(|channel| channel.stats())
    }
}

impl Drop for SynchronizationAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SynchronizationAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationAgent")
            .field("rank", &self.rank())
            .field("channels", &self.shared.channels.read().len())
            .field("config", &self.shared.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn run(&self) {
        let bind_context = self.bind_context.lock().take();
        if let Some(bind) = bind_context {
            bind();
        }

        let rank = self.transport.rank();
        info!(rank = rank; "synchronization loop started");

        while self.control.checkpoint(self.config.poll_interval) {
            if let Err((id, e)) = self.pass() {
                error!(rank = rank, id = id; "synchronization failed: {e}");
                (self.on_fatal)(&e);
                break;
            }
        }

        self.control.finish();
        info!(rank = rank; "synchronization loop stopped");
    }

    /// Services every channel once, in registration order.
    fn pass(&self) -> std::result::Result<(), (GroupId, SyncErr)> {
        let channels = self.channels.read();

        for channel in channels.iter() {
            self.service(channel).map_err(|e| (channel.id(), e))?;
        }

        Ok(())
    }

    fn service(&self, channel: &ParameterChannel) -> Result<()> {
        if channel.shape().is_none() {
            return Ok(());
        }

        let transport = &*self.transport;

        if channel.poll_recv(transport)? {
            trace!(id = channel.id(); "delta received");
        }

        if channel.poll_send(transport)? {
            trace!(id = channel.id(); "delta sent");
        }

        Ok(())
    }
}
