/// Primitive number types that can back a receive buffer.
pub trait Align1: bytemuck::Pod {}

/// Primitive number types whose alignment is at least 4 bytes, any `f32` payload
/// deserialized out of a buffer of these is properly aligned.
pub trait Align4: Align1 {}

macro_rules! impl_align {
    ($trait:ident: $($ty:ty),*) => {
        $(impl $trait for $ty {})*
    };
}

impl_align!(Align1: u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);
impl_align!(Align4: u32, i32, u64, i64, f32, f64);
