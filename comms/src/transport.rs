use std::io;

use tokio::sync::oneshot::{self, error::TryRecvError};

/// Routes messages belonging to one logical stream, e.g. one parameter group.
pub type Tag = u32;

/// A message-passing substrate with non-blocking point-to-point sends and
/// any-source receives.
///
/// Implementations must allow at most one outstanding receive per tag, sends
/// to the same peer and tag are delivered in issue order.
pub trait Transport: Send + Sync {
    /// This participant's rank, in `0..world_size()`.
    fn rank(&self) -> usize;

    /// The total amount of participants.
    fn world_size(&self) -> usize;

    /// Issues a non-blocking send of `data` to `peer`.
    ///
    /// # Arguments
    /// * `peer` - The destination rank.
    /// * `tag` - The stream the message belongs to.
    /// * `data` - The payload, copied before this call returns.
    ///
    /// # Returns
    /// A request to poll for completion, or an io error if the send can't be issued.
    fn isend(&self, peer: usize, tag: Tag, data: &[f32]) -> io::Result<SendRequest>;

    /// Issues a non-blocking receive of the next message tagged `tag`, from any peer.
    ///
    /// # Arguments
    /// * `tag` - The stream to receive from.
    ///
    /// # Returns
    /// A request to poll for completion, or an `AlreadyExists` io error
    /// if a receive for `tag` is already outstanding.
    fn irecv_any(&self, tag: Tag) -> io::Result<RecvRequest>;

    /// Every rank except this one.
    fn peers(&self) -> Vec<usize> {
        let rank = self.rank();
        (0..self.world_size()).filter(|&peer| peer != rank).collect()
    }
}

#[derive(Debug)]
enum SendState {
    Done,
    Pending(oneshot::Receiver<io::Result<()>>),
}

/// The handle of an issued send.
#[derive(Debug)]
pub struct SendRequest {
    state: SendState,
}

/// The transport's end of a pending `SendRequest`.
#[derive(Debug)]
pub struct SendCompletion(oneshot::Sender<io::Result<()>>);

impl SendRequest {
    /// Creates a request that has already completed, for transports
    /// that hand the payload over synchronously.
    pub fn completed() -> Self {
        Self {
            state: SendState::Done,
        }
    }

    /// Creates a pending request together with the handle that completes it.
    pub fn pending() -> (Self, SendCompletion) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            state: SendState::Pending(rx),
        };

        (request, SendCompletion(tx))
    }

    /// Polls the request without blocking.
    ///
    /// # Returns
    /// Whether the peer took custody of the payload, or the io error
    /// that made the delivery fail.
    pub fn test(&mut self) -> io::Result<bool> {
        let SendState::Pending(rx) = &mut self.state else {
            return Ok(true);
        };

        match rx.try_recv() {
            Ok(res) => {
                self.state = SendState::Done;
                res.map(|()| true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Closed) => {
                self.state = SendState::Done;
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "the transport dropped the send before completing it",
                ))
            }
        }
    }
}

impl SendCompletion {
    /// Completes the paired `SendRequest` with `res`.
    pub fn complete(self, res: io::Result<()>) {
        // The request may have been dropped already, nobody is left to notify.
        let _ = self.0.send(res);
    }
}

/// The handle of an issued any-source receive.
#[derive(Debug)]
pub struct RecvRequest {
    rx: oneshot::Receiver<Box<[f32]>>,
    data: Option<Box<[f32]>>,
}

impl RecvRequest {
    pub(crate) fn new(rx: oneshot::Receiver<Box<[f32]>>) -> Self {
        Self { rx, data: None }
    }

    /// Polls the request without blocking.
    ///
    /// # Returns
    /// Whether a message arrived, or an io error if the transport went away.
    pub fn test(&mut self) -> io::Result<bool> {
        if self.data.is_some() {
            return Ok(true);
        }

        match self.rx.try_recv() {
            Ok(data) => {
                self.data = Some(data);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Closed) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "the transport dropped the receive before completing it",
            )),
        }
    }

    /// The amount of elements actually received, once completed.
    pub fn count(&self) -> Option<usize> {
        self.data.as_deref().map(<[f32]>::len)
    }

    /// The received payload, once completed.
    pub fn data(&self) -> Option<&[f32]> {
        self.data.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_send_completes_once_signalled() {
        let (mut request, completion) = SendRequest::pending();
        assert!(!request.test().unwrap());

        completion.complete(Ok(()));
        assert!(request.test().unwrap());
        assert!(request.test().unwrap());
    }

    #[test]
    fn failed_send_surfaces_the_error() {
        let (mut request, completion) = SendRequest::pending();
        completion.complete(Err(io::Error::other("peer reset")));

        let err = request.test().unwrap_err();
        assert_eq!(err.to_string(), "peer reset");
    }

    #[test]
    fn abandoned_send_is_broken_pipe() {
        let (mut request, completion) = SendRequest::pending();
        drop(completion);

        let err = request.test().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn recv_reports_count_after_completion() {
        let (tx, rx) = oneshot::channel();
        let mut request = RecvRequest::new(rx);
        assert!(!request.test().unwrap());
        assert_eq!(request.count(), None);

        tx.send(vec![1.0; 9].into_boxed_slice()).unwrap();
        assert!(request.test().unwrap());
        assert_eq!(request.count(), Some(9));
    }
}
