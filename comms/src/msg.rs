use std::{borrow::Cow, io};

use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::{Deserialize, Serialize, Tag};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();
const TAG_SIZE: usize = size_of::<Tag>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const DELTA_KIND: Header = 2;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A gradient delta for the parameter group identified by `tag`.
    ///
    /// The header and tag are big endian, the values go out in the host's
    /// byte order without copying. Every node of a mesh must share it.
    Delta { tag: Tag, data: &'a [f32] },
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello { rank: usize },
    Disconnect,
}

/// The application layer message exchanged between nodes.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("the given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());

                // SAFETY: `Command` derives `Serialize` and holds no maps, writing
                //         into a `Vec` can't fail.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(Payload::Delta { tag, data }) => {
                buf.extend_from_slice(&DELTA_KIND.to_be_bytes());
                buf.extend_from_slice(&tag.to_be_bytes());
                Some(bytemuck::cast_slice(data))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);

        // SAFETY: The buffer was split to be exactly `HEADER_SIZE` bytes just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_KIND => {
                let text = std::str::from_utf8(rest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                Ok(Self::Err(Cow::Borrowed(text)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            DELTA_KIND => {
                if rest.len() < TAG_SIZE {
                    return Self::buf_is_too_small(rest.len() + HEADER_SIZE, HEADER_SIZE + TAG_SIZE);
                }

                let (tag_buf, nums) = rest.split_at_mut(TAG_SIZE);

                // SAFETY: Same as above, `tag_buf` is exactly `TAG_SIZE` bytes.
                let tag = Tag::from_be_bytes(tag_buf.try_into().unwrap());
                let data = bytemuck::try_cast_slice(nums).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("invalid delta body: {e:?}"))
                })?;

                Ok(Self::Data(Payload::Delta { tag, data }))
            }
            other => Self::invalid_kind(other),
        }
    }
}
