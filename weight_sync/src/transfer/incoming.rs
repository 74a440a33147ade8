use comms::{RecvRequest, Transport};
use log::trace;

use crate::{GroupId, Result, SyncErr};

/// The incoming side of a parameter group: a target slot and at most one
/// outstanding any-source receive.
#[derive(Debug)]
pub struct IncomingBuffer {
    id: GroupId,
    target: Box<[f32]>,
    request: Option<RecvRequest>,
    started: bool,
}

impl IncomingBuffer {
    /// Creates a new idle `IncomingBuffer`.
    ///
    /// # Arguments
    /// * `id` - The group this buffer belongs to, used as the wire tag.
    /// * `len` - The exact amount of elements every received delta must carry.
    pub fn new(id: GroupId, len: usize) -> Self {
        Self {
            id,
            target: vec![0.; len].into_boxed_slice(),
            request: None,
            started: false,
        }
    }

    /// Posts an any-source receive, unless one was already started.
    pub fn start_recv(&mut self, transport: &dyn Transport) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.request = Some(transport.irecv_any(self.id)?);
        self.started = true;
        trace!(id = self.id; "receive posted");
        Ok(())
    }

    /// Polls the outstanding receive, copying a completed delta into the target.
    ///
    /// # Returns
    /// Whether a delta landed in the target, or a `ProtocolDesync` error if
    /// its element count isn't the target's. The target is left untouched
    /// in that case.
    pub fn recv_done(&mut self) -> Result<bool> {
        let Some(request) = &mut self.request else {
            return Ok(false);
        };

        if !request.test()? {
            return Ok(false);
        }

        let Some(data) = request.data() else {
            return Ok(false);
        };

        if data.len() != self.target.len() {
            return Err(SyncErr::ProtocolDesync {
                id: self.id,
                expected: self.target.len(),
                got: data.len(),
            });
        }

        self.target.copy_from_slice(data);
        self.request = None;
        Ok(true)
    }

    /// Marks the buffer idle so the next `start_recv` posts a new receive.
    pub fn reset(&mut self) {
        self.started = false;
    }

    /// Whether a receive has been posted and not reset yet.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The last delta received.
    pub fn target(&self) -> &[f32] {
        &self.target
    }
}
