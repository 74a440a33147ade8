use std::{num::NonZeroUsize, sync::OnceLock};

use comms::Transport;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    GroupId, IncomingBuffer, OutgoingBuffer, Result, SyncErr,
    policy::{CombinationPolicy, accumulate},
};

/// Per channel transfer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Swaps that shipped a pending slot to the peers.
    pub sends: usize,
    /// Remote deltas folded into the accumulator.
    pub receives: usize,
    /// Steps that consumed a ready accumulator.
    pub drains: usize,
    /// Steps that only had the local gradient to apply.
    pub local_only_steps: usize,
}

#[derive(Debug, Default)]
struct SendSide {
    outgoing: Option<OutgoingBuffer>,
    sends: usize,
}

#[derive(Debug)]
struct RecvSide {
    incoming: Option<IncomingBuffer>,
    accumulator: Box<[f32]>,
    ready: bool,
    policy: Box<dyn CombinationPolicy>,
    receives: usize,
    drains: usize,
    local_only_steps: usize,
}

/// The synchronization state of one distributed parameter group.
///
/// The send lock guards the outgoing buffers, the receive lock guards the
/// incoming buffer, the accumulator and the policy. Neither lock is ever
/// held while waiting on the network. When both are needed the send lock
/// is taken first.
#[derive(Debug)]
pub struct ParameterChannel {
    id: GroupId,
    shape: OnceLock<(usize, usize)>,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
}

impl ParameterChannel {
    /// Creates a new shapeless `ParameterChannel`.
    ///
    /// # Arguments
    /// * `id` - The group id, also the wire tag.
    /// * `policy` - How deltas are combined and applied.
    pub fn new(id: GroupId, policy: Box<dyn CombinationPolicy>) -> Self {
        Self {
            id,
            shape: OnceLock::new(),
            send: Mutex::new(SendSide::default()),
            recv: Mutex::new(RecvSide {
                incoming: None,
                accumulator: Box::default(),
                ready: false,
                policy,
                receives: 0,
                drains: 0,
                local_only_steps: 0,
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The `(rows, cols)` this channel was sized with, if any.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape.get().copied()
    }

    /// Sizes the buffers for `shape` the first time it's called, later calls
    /// only check `shape` against the one already set.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if the channel was sized with a different shape.
    pub fn ensure_initialized(&self, shape: (usize, usize)) -> Result<()> {
        if let Some(&expected) = self.shape.get() {
            return self.check_shape(expected, shape);
        }

        let mut send = self.send.lock();
        let mut recv = self.recv.lock();

        // Someone else may have won the race while we waited on the locks.
        if let Some(&expected) = self.shape.get() {
            return self.check_shape(expected, shape);
        }

        let len = shape.0 * shape.1;
        send.outgoing = Some(OutgoingBuffer::new(self.id, len));
        recv.incoming = Some(IncomingBuffer::new(self.id, len));
        recv.accumulator = vec![0.; len].into_boxed_slice();

        // Published last, the loop skips the channel until the buffers exist.
        let _ = self.shape.set(shape);
        debug!(id = self.id, rows = shape.0, cols = shape.1; "channel initialized");
        Ok(())
    }

    fn check_shape(&self, expected: (usize, usize), got: (usize, usize)) -> Result<()> {
        if expected != got {
            return Err(SyncErr::ShapeMismatch {
                id: self.id,
                expected,
                got,
            });
        }

        Ok(())
    }

    /// Runs the policy's pre-send hook on `delta` and adds it to the pending slot.
    pub fn enqueue(&self, delta: &[f32]) -> Result<()> {
        self.recv.lock().policy.pre_send(delta);

        let mut send = self.send.lock();
        let outgoing = send
            .outgoing
            .as_mut()
            .ok_or(SyncErr::Uninitialized { id: self.id })?;

        outgoing.add_delta(delta)
    }

    /// Takes whatever arrived from the peers and applies one optimization step.
    ///
    /// If the accumulator is ready it's added to a copy of `grads` staged
    /// in `scratch`, then cleared. Every delta in it already went through
    /// the policy's `merge` when it arrived. Otherwise only the local gradient is applied.
    ///
    /// # Arguments
    /// * `scratch` - Staging space, resized as needed.
    /// * `grads` - The local gradient.
    /// * `momentum` - The velocity buffer, updated in place.
    /// * `weights` - The parameters, updated in place.
    /// * `batch_size` - The amount of samples `grads` was summed over.
    pub fn drain_and_apply(
        &self,
        scratch: &mut Vec<f32>,
        grads: &[f32],
        momentum: &mut [f32],
        weights: &mut [f32],
        batch_size: NonZeroUsize,
    ) -> Result<()> {
        let mut guard = self.recv.lock();
        let recv = &mut *guard;

        if recv.incoming.is_none() {
            return Err(SyncErr::Uninitialized { id: self.id });
        }

        if !recv.ready {
            recv.local_only_steps += 1;
            return recv.policy.apply(weights, momentum, grads, batch_size);
        }

        if grads.len() != recv.accumulator.len() {
            return Err(SyncErr::LengthMismatch {
                what: "gradient",
                expected: recv.accumulator.len(),
                got: grads.len(),
            });
        }

        scratch.clear();
        scratch.extend_from_slice(grads);
        accumulate(&recv.accumulator, &mut scratch[..]);
        recv.accumulator.fill(0.);
        recv.ready = false;
        recv.drains += 1;

        trace!(id = self.id, merged = recv.policy.merged(); "drained accumulator");
        recv.policy.apply(weights, momentum, &scratch[..], batch_size)
    }

    /// Advances the receive state machine once.
    ///
    /// A completed receive is merged into the accumulator through the policy
    /// and the next receive is posted right away.
    ///
    /// # Returns
    /// Whether a delta was received, or the fatal error that stopped it.
    pub fn poll_recv(&self, transport: &dyn Transport) -> Result<bool> {
        let mut guard = self.recv.lock();
        let recv = &mut *guard;

        let Some(incoming) = recv.incoming.as_mut() else {
            return Ok(false);
        };

        incoming.start_recv(transport)?;
        if !incoming.recv_done()? {
            return Ok(false);
        }

        recv.policy.merge(incoming.target(), &mut recv.accumulator);
        recv.ready = true;
        recv.receives += 1;

        incoming.reset();
        incoming.start_recv(transport)?;
        Ok(true)
    }

    /// Advances the send state machine once.
    ///
    /// Once the previous sends completed, a pending slot holding new deltas
    /// is swapped in and shipped to every peer.
    ///
    /// # Returns
    /// Whether new sends were issued.
    pub fn poll_send(&self, transport: &dyn Transport) -> Result<bool> {
        let mut guard = self.send.lock();
        let send = &mut *guard;

        let Some(outgoing) = send.outgoing.as_mut() else {
            return Ok(false);
        };

        if !outgoing.send_done()? || !outgoing.has_pending() {
            return Ok(false);
        }

        outgoing.swap_pending()?;
        outgoing.start_send(transport)?;
        send.sends += 1;
        Ok(true)
    }

    /// Whether a remote delta is waiting to be drained.
    pub fn is_ready(&self) -> bool {
        self.recv.lock().ready
    }

    pub fn stats(&self) -> ChannelStats {
        let sends = self.send.lock().sends;
        let recv = self.recv.lock();

        ChannelStats {
            sends,
            receives: recv.receives,
            drains: recv.drains,
            local_only_steps: recv.local_only_steps,
        }
    }
}
