/// Types that can be written as the body of a frame.
pub trait Serialize<'a> {
    /// Writes the owned part of the body into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The body buffer, empty on entry.
    ///
    /// # Returns
    /// Trailing bytes borrowed from `self`, sent right after `buf` without being copied into it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
