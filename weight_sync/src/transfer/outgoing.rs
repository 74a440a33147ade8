use comms::{SendRequest, Transport};
use log::trace;

use crate::{GroupId, Result, SyncErr};

/// The double-buffered outgoing side of a parameter group.
///
/// New deltas are summed into the pending slot while the sending slot is
/// being shipped to every peer. Once every send completed the slots trade
/// places and the drained one is zeroed.
#[derive(Debug)]
pub struct OutgoingBuffer {
    id: GroupId,
    slots: [Box<[f32]>; 2],
    sending: usize,
    dirty: bool,
    requests: Vec<SendRequest>,
}

impl OutgoingBuffer {
    /// Creates a new `OutgoingBuffer` with both slots zeroed.
    ///
    /// # Arguments
    /// * `id` - The group this buffer belongs to, used as the wire tag.
    /// * `len` - The amount of elements per slot.
    pub fn new(id: GroupId, len: usize) -> Self {
        Self {
            id,
            slots: [
                vec![0.; len].into_boxed_slice(),
                vec![0.; len].into_boxed_slice(),
            ],
            sending: 0,
            dirty: false,
            requests: Vec::new(),
        }
    }

    /// Adds `delta` into the pending slot, never waits on the network.
    ///
    /// # Returns
    /// A `LengthMismatch` error if `delta` doesn't fit the slot.
    pub fn add_delta(&mut self, delta: &[f32]) -> Result<()> {
        let pending = &mut self.slots[self.sending ^ 1];
        if delta.len() != pending.len() {
            return Err(SyncErr::LengthMismatch {
                what: "outgoing delta",
                expected: pending.len(),
                got: delta.len(),
            });
        }

        pending.iter_mut().zip(delta).for_each(|(acc, d)| *acc += d);
        self.dirty = true;
        Ok(())
    }

    /// Whether a delta was added since the last swap.
    pub fn has_pending(&self) -> bool {
        self.dirty
    }

    /// Issues one non-blocking send of the sending slot to every peer.
    ///
    /// # Arguments
    /// * `transport` - The transport to send through.
    pub fn start_send(&mut self, transport: &dyn Transport) -> Result<()> {
        let data = &self.slots[self.sending];

        for peer in transport.peers() {
            let request = transport.isend(peer, self.id, data)?;
            self.requests.push(request);
        }

        trace!(id = self.id, peers = self.requests.len(); "sends issued");
        Ok(())
    }

    /// Polls the outstanding sends, forgetting the completed ones.
    ///
    /// # Returns
    /// Whether no send is outstanding anymore, or the io error of a failed one.
    pub fn send_done(&mut self) -> Result<bool> {
        let mut i = 0;
        while i < self.requests.len() {
            if self.requests[i].test()? {
                self.requests.swap_remove(i);
            } else {
                i += 1;
            }
        }

        Ok(self.requests.is_empty())
    }

    /// Zeroes the sending slot and makes the pending slot the sending one.
    ///
    /// # Returns
    /// A `SendInFlight` error if the sending slot is still being shipped.
    pub fn swap_pending(&mut self) -> Result<()> {
        if !self.requests.is_empty() {
            return Err(SyncErr::SendInFlight { id: self.id });
        }

        self.slots[self.sending].fill(0.);
        self.sending ^= 1;
        self.dirty = false;
        Ok(())
    }

    /// The slot being shipped.
    pub fn sending(&self) -> &[f32] {
        &self.slots[self.sending]
    }

    /// The slot new deltas are summed into.
    pub fn pending(&self) -> &[f32] {
        &self.slots[self.sending ^ 1]
    }
}
