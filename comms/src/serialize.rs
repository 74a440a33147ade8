/// Writes a value into a frame buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame buffer, already holding the length prefix.
    ///
    /// # Returns
    /// Optionally a borrowed tail that must be written right after `buf`,
    /// used to avoid copying large numeric payloads.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
