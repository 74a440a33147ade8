//! The sending end of the length-prefixed framing.

use std::io;

use log::trace;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes length-prefixed frames into an async writer.
///
/// Frame headers are staged in a reusable buffer, so steady state sends
/// don't allocate.
pub struct OnoSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Creates a new `OnoSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Frames and writes `msg`, flushing the writer afterwards.
    ///
    /// The length prefix and header go through the internal buffer, the
    /// numeric tail (if any) is written straight from the caller's memory.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An io error on failure, or an `InvalidInput` one if the frame is larger
    /// than a receiver accepts, in which case nothing is written.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(buf);
        let len = buf.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to send a frame of {len} bytes"),
            ));
        }

        buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        trace!(len = len; "writing frame");

        tx.write_all(buf).await?;

        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}
