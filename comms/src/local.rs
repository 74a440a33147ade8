use std::{io, sync::Arc};

use crate::{Mailbox, RecvRequest, SendRequest, Tag, Transport};

/// An in-process mesh, every rank delivers straight into its peers' mailboxes.
///
/// Sends complete as soon as they're issued since the payload is copied
/// into the destination mailbox right away.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: usize,
    mailboxes: Arc<[Mailbox]>,
}

impl LocalTransport {
    /// Creates the transports of a fully connected mesh of `size` ranks.
    ///
    /// # Arguments
    /// * `size` - The amount of participants.
    ///
    /// # Returns
    /// One transport per rank, indexed by rank.
    pub fn mesh(size: usize) -> Vec<Self> {
        let mailboxes: Arc<[Mailbox]> = (0..size).map(|_| Mailbox::new()).collect();

        (0..size)
            .map(|rank| Self {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }

    /// The mailbox of this rank.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailboxes[self.rank]
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    fn isend(&self, peer: usize, tag: Tag, data: &[f32]) -> io::Result<SendRequest> {
        let mailbox = self.mailboxes.get(peer).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("peer {peer} is out of range for a mesh of {}", self.mailboxes.len()),
            )
        })?;

        mailbox.deliver(tag, data.into());
        Ok(SendRequest::completed())
    }

    fn irecv_any(&self, tag: Tag) -> io::Result<RecvRequest> {
        self.mailbox().post(tag)
    }
}
