mod align;
mod deserialize;
mod local;
mod mailbox;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
mod tcp;
mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use deserialize::Deserialize;
pub use local::LocalTransport;
pub use mailbox::Mailbox;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;
pub use tcp::TcpTransport;
pub use transport::{RecvRequest, SendCompletion, SendRequest, Tag, Transport};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames bigger than this are treated as corrupted rather than allocated.
const MAX_FRAME_LEN: usize = 1 << 31;

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
