//! The receiving end of the length-prefixed framing.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits to receive a new message from the inner reader.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned `T`'s
    ///           lifetime is tied to it. Its element type fixes the alignment
    ///           of the frame body.
    ///
    /// # Returns
    /// The decoded message or an io error.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), <B as bytemuck::Zeroable>::zeroed());

        let bytes = &mut bytemuck::cast_slice_mut(buf.as_mut_slice())[..len];
        self.rx.read_exact(bytes).await?;

        T::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io;

    use crate::msg::{Command, Msg, Payload};

    #[tokio::test]
    async fn send_recv_delta() {
        let (one, two) = io::duplex(256);
        let (rx1, tx1) = io::split(one);
        let (rx2, tx2) = io::split(two);
        let (_, mut tx) = crate::channel(rx1, tx1);
        let (mut rx, _) = crate::channel(rx2, tx2);

        let data = [0.5_f32, 1.5, -3.0];
        tx.send(&Msg::Data(Payload::Delta { tag: 11, data: &data }))
            .await
            .unwrap();
        tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();

        let mut buf: Vec<f32> = Vec::new();
        let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
        match msg {
            Msg::Data(Payload::Delta { tag, data: got }) => {
                assert_eq!(tag, 11);
                assert_eq!(got, data);
            }
            other => panic!("unexpected message {other:?}"),
        }

        let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
        match msg {
            Msg::Control(cmd) => assert_eq!(cmd, Command::Disconnect),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_stream_is_an_error() {
        let (one, two) = io::duplex(64);
        drop(one);

        let (mut rx, _) = crate::channel(two, io::sink());
        let mut buf: Vec<f32> = Vec::new();
        let res: std::io::Result<Msg> = rx.recv_into(&mut buf).await;
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
