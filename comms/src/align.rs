/// Primitive element types usable as receive buffers.
///
/// Their alignment is at least 8 bytes, so after the 8 byte message header
/// both `f32` and `f64` payloads can be viewed in place.
pub trait Align8: bytemuck::Pod {}

impl Align8 for u64 {}
impl Align8 for i64 {}
impl Align8 for f64 {}
impl Align8 for u128 {}
impl Align8 for i128 {}
