use std::{
    collections::{HashMap, VecDeque},
    io,
};

use log::trace;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{RecvRequest, Tag};

#[derive(Debug, Default)]
struct Slots {
    arrived: HashMap<Tag, VecDeque<Box<[f32]>>>,
    waiting: HashMap<Tag, oneshot::Sender<Box<[f32]>>>,
}

/// Matches arriving payloads with posted any-source receives, per tag.
///
/// Payloads that arrive while nobody is waiting on their tag are queued in
/// arrival order, they're never dropped.
#[derive(Debug, Default)]
pub struct Mailbox {
    slots: Mutex<Slots>,
}

impl Mailbox {
    /// Creates a new empty `Mailbox`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `data` to the receive waiting on `tag`, or queues it.
    ///
    /// # Arguments
    /// * `tag` - The stream the payload belongs to.
    /// * `data` - The received payload.
    pub fn deliver(&self, tag: Tag, data: Box<[f32]>) {
        let mut slots = self.slots.lock();

        let data = match slots.waiting.remove(&tag) {
            Some(waiter) => match waiter.send(data) {
                Ok(()) => return,
                // The receive was abandoned, keep the payload for the next one.
                Err(data) => data,
            },
            None => data,
        };

        trace!(tag = tag, len = data.len(); "queueing payload");
        slots.arrived.entry(tag).or_default().push_back(data);
    }

    /// Posts an any-source receive for `tag`.
    ///
    /// # Arguments
    /// * `tag` - The stream to receive from.
    ///
    /// # Returns
    /// A receive request, already completed if a payload was queued, or an
    /// `AlreadyExists` io error if another receive on `tag` is still pending.
    pub fn post(&self, tag: Tag) -> io::Result<RecvRequest> {
        let mut slots = self.slots.lock();

        if slots.waiting.get(&tag).is_some_and(|waiter| !waiter.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("a receive for tag {tag} is already outstanding"),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let queued = slots.arrived.get_mut(&tag).and_then(VecDeque::pop_front);

        match queued {
            Some(data) => {
                // `rx` is alive right here, this send can't fail.
                let _ = tx.send(data);
                slots.waiting.remove(&tag);
            }
            None => {
                slots.waiting.insert(tag, tx);
            }
        }

        Ok(RecvRequest::new(rx))
    }

    /// The amount of payloads queued for `tag` with no receive to take them.
    pub fn queued(&self, tag: Tag) -> usize {
        self.slots.lock().arrived.get(&tag).map_or(0, VecDeque::len)
    }
}
