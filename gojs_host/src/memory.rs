use crate::*;
use std::mem::*;
use wasm_runtime_layer::*;

/// The size of one unit of linear memory growth.
pub const PAGE_SIZE: usize = 65536;

/// Byte order of a typed memory access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first. Every value the guest encodes itself uses this.
    Little,
    /// Most significant byte first.
    Big
}

/// A typed view over the guest's linear memory. Writes past the end of
/// memory grow it by whole pages; reads past the end are protocol errors.
#[derive(Clone)]
pub struct LinearMemory {
    /// The exported memory object.
    memory: Memory
}

impl LinearMemory {
    /// Wraps an exported guest memory.
    pub fn new(memory: Memory) -> Self {
        Self {
            memory
        }
    }

    /// The number of addressable bytes.
    pub fn size(&self, ctx: impl AsContext) -> usize {
        self.memory.current_pages(ctx) as usize * PAGE_SIZE
    }

    /// The number of whole pages currently allocated.
    pub fn pages(&self, ctx: impl AsContext) -> usize {
        self.memory.current_pages(ctx) as usize
    }

    /// Fills `buffer` with the bytes starting at `offset`.
    pub fn read(&self, ctx: impl AsContext, offset: u32, buffer: &mut [u8]) -> Result<(), GuestError> {
        let end = offset as usize + buffer.len();
        let size = self.size(&ctx);
        if end > size {
            return Err(GuestError::ProtocolMismatch(format!("Read of {} bytes at {offset:#x} exceeds memory size {size:#x}", buffer.len())));
        }

        self.memory.read(ctx, offset as usize, buffer).map_err(GuestError::from_protocol)
    }

    /// Copies `len` bytes starting at `offset` into a new buffer.
    pub fn read_vec(&self, ctx: impl AsContext, offset: u32, len: usize) -> Result<Vec<u8>, GuestError> {
        let mut result = vec![0; len];
        self.read(ctx, offset, &mut result)?;
        Ok(result)
    }

    /// Writes `bytes` at `offset`, first growing memory if the range does not fit.
    pub fn write(&self, mut ctx: impl AsContextMut, offset: u32, bytes: &[u8]) -> Result<(), GuestError> {
        let needed = offset as usize + bytes.len();
        let available = self.size(&ctx);
        if needed > available {
            let pages = (needed - available).div_ceil(PAGE_SIZE) as u32;
            tracing::debug!(pages, needed, available, "Growing linear memory");
            self.memory.grow(&mut ctx, pages).map_err(|x| GuestError::MemoryGrowthFailure { pages, reason: x.to_string() })?;
        }

        self.memory.write(ctx, offset as usize, bytes).map_err(GuestError::from_protocol)
    }
}

macro_rules! typed_accessors {
    ($($ty:ty => $get:ident, $set:ident;)*) => {
        impl LinearMemory {
            $(
                #[doc = concat!("Reads a `", stringify!($ty), "` at the given offset.")]
                pub fn $get(&self, ctx: impl AsContext, offset: u32, endian: Endian) -> Result<$ty, GuestError> {
                    let mut bytes = [0; size_of::<$ty>()];
                    self.read(ctx, offset, &mut bytes)?;
                    Ok(match endian {
                        Endian::Little => <$ty>::from_le_bytes(bytes),
                        Endian::Big => <$ty>::from_be_bytes(bytes)
                    })
                }

                #[doc = concat!("Writes a `", stringify!($ty), "` at the given offset.")]
                pub fn $set(&self, ctx: impl AsContextMut, offset: u32, value: $ty, endian: Endian) -> Result<(), GuestError> {
                    let bytes = match endian {
                        Endian::Little => value.to_le_bytes(),
                        Endian::Big => value.to_be_bytes()
                    };
                    self.write(ctx, offset, &bytes)
                }
            )*
        }
    };
}

typed_accessors! {
    u8 => get_u8, set_u8;
    i8 => get_i8, set_i8;
    u16 => get_u16, set_u16;
    i16 => get_i16, set_i16;
    u32 => get_u32, set_u32;
    i32 => get_i32, set_i32;
    u64 => get_u64, set_u64;
    i64 => get_i64, set_i64;
    f32 => get_f32, set_f32;
    f64 => get_f64, set_f64;
}
