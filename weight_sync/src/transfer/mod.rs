mod incoming;
mod outgoing;

pub use incoming::IncomingBuffer;
pub use outgoing::OutgoingBuffer;
