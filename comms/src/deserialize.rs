use std::io;

/// Reads a value out of a received frame, possibly borrowing from it.
pub trait Deserialize<'a>: Sized {
    /// Deserializes a frame body.
    ///
    /// # Arguments
    /// * `buf` - The frame body without the length prefix.
    ///
    /// # Returns
    /// The decoded value or an `InvalidData` io error.
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
