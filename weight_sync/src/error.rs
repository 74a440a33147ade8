use std::{error::Error, fmt, io};

use crate::GroupId;

/// The weight synchronization result type.
pub type Result<T> = std::result::Result<T, SyncErr>;

/// Synchronization failures.
///
/// Transient conditions (a send still in flight, nothing received yet) are
/// never errors, everything here is either a transport failure or a bug in
/// how the engine is being driven.
#[derive(Debug)]
pub enum SyncErr {
    Io(io::Error),
    /// A peer sent a buffer whose element count differs from ours, the nodes
    /// disagree about the parameter group's shape.
    ProtocolDesync {
        id: GroupId,
        expected: usize,
        got: usize,
    },
    /// A tensor handed to a channel doesn't match the shape it was sized with.
    ShapeMismatch {
        id: GroupId,
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// Two flat buffers that must line up don't.
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A tensor view that isn't laid out contiguously in memory.
    NonContiguous { id: GroupId },
    /// Storage or buffers were used before being created.
    Uninitialized { id: GroupId },
    /// The outgoing buffers were asked to swap while a send is still outstanding.
    SendInFlight { id: GroupId },
    UnknownGroup { id: GroupId },
    /// The adaptive policy can't scale its rate by this accumulated magnitude.
    InvalidMagnitude { magnitude: f64 },
    AlreadyStarted,
    /// A mirror handle whose source was dropped.
    Detached,
}

impl fmt::Display for SyncErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErr::Io(e) => write!(f, "io error: {e}"),
            SyncErr::ProtocolDesync { id, expected, got } => write!(
                f,
                "protocol desync on parameter group {id}: expected {expected} elements, received {got}"
            ),
            SyncErr::ShapeMismatch { id, expected, got } => write!(
                f,
                "shape mismatch on parameter group {id}: expected {expected:?}, got {got:?}"
            ),
            SyncErr::LengthMismatch {
                what,
                expected,
                got,
            } => write!(f, "length mismatch for {what}: expected {expected}, got {got}"),
            SyncErr::NonContiguous { id } => {
                write!(f, "parameter group {id} was handed a non contiguous tensor")
            }
            SyncErr::Uninitialized { id } => {
                write!(f, "parameter group {id} was used before its storage was created")
            }
            SyncErr::SendInFlight { id } => write!(
                f,
                "parameter group {id} tried to swap its outgoing buffers while a send is in flight"
            ),
            SyncErr::UnknownGroup { id } => write!(f, "unknown parameter group {id}"),
            SyncErr::InvalidMagnitude { magnitude } => {
                write!(f, "can't scale the learning rate by a gradient magnitude of {magnitude}")
            }
            SyncErr::AlreadyStarted => f.write_str("the synchronization loop was already started"),
            SyncErr::Detached => f.write_str("the source of this mirror handle was dropped"),
        }
    }
}

impl Error for SyncErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SyncErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SyncErr> for io::Error {
    fn from(value: SyncErr) -> Self {
        match value {
            SyncErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
