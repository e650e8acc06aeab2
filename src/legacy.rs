//! Scalar reads from a managed value through a full marshal round-trip.
//!
//! Old interop surfaces only hand over the managed value, never a native address, so
//! reading one field that may need custom marshaling means marshaling the whole value into
//! a scratch buffer, reading from it, and tearing the buffer down again. This is slow, and
//! any pointer read this way dangles once the call returns. Prefer reading from a native
//! buffer you own.
use crate::{
    engine::MarshalEngine,
    error::{MarshalError, MarshalResult},
    pointer::NativePtr,
    types::{TypeHandle, TypeKind},
    value::ManagedValue,
};
use std::ptr;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarWidth {
    Byte = 1,
    Int16 = 2,
    Int32 = 4,
    Int64 = 8,
}

impl ScalarWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for ScalarWidth {
    type Error = MarshalError;

    fn try_from(width: usize) -> Result<Self, Self::Error> {
        match width {
            1 => Ok(ScalarWidth::Byte),
            2 => Ok(ScalarWidth::Int16),
            4 => Ok(ScalarWidth::Int32),
            8 => Ok(ScalarWidth::Int64),
            _ => Err(MarshalError::invalid_argument(
                "width",
                format!("{} is not a scalar width", width),
            )),
        }
    }
}

/// A native scratch buffer that is destroyed and freed exactly once, on whichever path
/// leaves the read.
struct ScratchBuffer<'e> {
    engine: &'e MarshalEngine,
    ty: &'e TypeHandle,
    ptr: NativePtr,
    released: bool,
}

impl<'e> ScratchBuffer<'e> {
    fn allocate(engine: &'e MarshalEngine, ty: &'e TypeHandle, size: usize) -> MarshalResult<Self> {
        let ptr = engine.heap().alloc(size)?;
        // destroy stubs must never see garbage pointers, even if marshaling fails early
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(Self {
            engine,
            ty,
            ptr,
            released: false,
        })
    }

    fn cleanup(&mut self) -> MarshalResult<()> {
        self.released = true;
        // SAFETY: the buffer is zeroed or holds a value marshaled for `ty`.
        let destroyed = unsafe { self.engine.destroy(self.ptr, self.ty) };
        // SAFETY: allocated by this heap and freed only here.
        unsafe { self.engine.heap().free(self.ptr) };
        destroyed
    }

    fn release(mut self) -> MarshalResult<()> {
        self.cleanup()
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cleanup() {
                warn!("failed to destroy scratch buffer for {}: {}", self.ty.name(), e);
            }
        }
    }
}

pub struct LegacyScalarAccess<'e> {
    engine: &'e MarshalEngine,
}

impl<'e> LegacyScalarAccess<'e> {
    pub fn new(engine: &'e MarshalEngine) -> Self {
        Self { engine }
    }

    /// Reads `width` bytes at `offset` of the native representation of `source`, in native
    /// byte order, zero-extended.
    pub fn read_scalar<'a>(
        &self,
        source: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
        width: ScalarWidth,
    ) -> MarshalResult<u64> {
        let Some(source) = source.into() else {
            return Err(MarshalError::MemoryFault);
        };
        let ty = source.type_handle();
        if matches!(
            self.engine.types().kind(ty),
            TypeKind::Array | TypeKind::Text | TypeKind::TextBuilder
        ) {
            return Err(MarshalError::Unsupported(format!(
                "legacy scalar reads from '{}'",
                ty.name()
            )));
        }

        let size = self.engine.native_size(ty)?;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|ofs| ofs.checked_add(width.bytes()).is_some_and(|end| end <= size))
            .ok_or_else(|| {
                MarshalError::out_of_range(
                    "ofs",
                    format!(
                        "reading {} bytes at {} overruns the {} byte native size of '{}'",
                        width.bytes(),
                        offset,
                        size,
                        ty.name()
                    ),
                )
            })?;

        let scratch = ScratchBuffer::allocate(self.engine, ty, size)?;
        // SAFETY: the scratch buffer holds `size` bytes.
        let read = unsafe { self.engine.to_native(source, scratch.ptr, false) }
            .map(|()| unsafe { read_native(scratch.ptr.byte_add(offset), width) });

        match (read, scratch.release()) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(
                    "cleanup after failed read of {} also failed: {}",
                    ty.name(),
                    cleanup
                );
                Err(e)
            }
        }
    }

    pub fn read_byte<'a>(
        &self,
        source: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
    ) -> MarshalResult<u8> {
        self.read_scalar(source, offset, ScalarWidth::Byte)
            .map(|v| v as u8)
    }

    pub fn read_int16<'a>(
        &self,
        source: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
    ) -> MarshalResult<i16> {
        self.read_scalar(source, offset, ScalarWidth::Int16)
            .map(|v| v as u16 as i16)
    }

    pub fn read_int32<'a>(
        &self,
        source: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
    ) -> MarshalResult<i32> {
        self.read_scalar(source, offset, ScalarWidth::Int32)
            .map(|v| v as u32 as i32)
    }

    pub fn read_int64<'a>(
        &self,
        source: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
    ) -> MarshalResult<i64> {
        self.read_scalar(source, offset, ScalarWidth::Int64)
            .map(|v| v as i64)
    }

    /// Writing through a managed value is not available on this path.
    pub fn write_scalar<'a>(
        &self,
        _target: impl Into<Option<&'a ManagedValue>>,
        _offset: i32,
        width: ScalarWidth,
        _value: u64,
    ) -> MarshalResult<()> {
        let name = match width {
            ScalarWidth::Byte => "WriteByte",
            ScalarWidth::Int16 => "WriteInt16",
            ScalarWidth::Int32 => "WriteInt32",
            ScalarWidth::Int64 => "WriteInt64",
        };
        Err(MarshalError::Unsupported(name.to_string()))
    }

    pub fn write_byte<'a>(
        &self,
        target: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
        value: u8,
    ) -> MarshalResult<()> {
        self.write_scalar(target, offset, ScalarWidth::Byte, value.into())
    }

    pub fn write_int16<'a>(
        &self,
        target: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
        value: i16,
    ) -> MarshalResult<()> {
        self.write_scalar(target, offset, ScalarWidth::Int16, value as u16 as u64)
    }

    pub fn write_int32<'a>(
        &self,
        target: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
        value: i32,
    ) -> MarshalResult<()> {
        self.write_scalar(target, offset, ScalarWidth::Int32, value as u32 as u64)
    }

    pub fn write_int64<'a>(
        &self,
        target: impl Into<Option<&'a ManagedValue>>,
        offset: i32,
        value: i64,
    ) -> MarshalResult<()> {
        self.write_scalar(target, offset, ScalarWidth::Int64, value as u64)
    }
}

unsafe fn read_native(at: NativePtr, width: ScalarWidth) -> u64 {
    let p = at.as_ptr();
    match width {
        ScalarWidth::Byte => u64::from(ptr::read(p)),
        ScalarWidth::Int16 => u64::from(ptr::read_unaligned(p as *const u16)),
        ScalarWidth::Int32 => u64::from(ptr::read_unaligned(p as *const u32)),
        ScalarWidth::Int64 => ptr::read_unaligned(p as *const u64),
    }
}
