//! Managed values and the pinning service that exposes their storage to native code.
use crate::{
    error::{MarshalError, MarshalResult},
    layout::HasLayout,
    pointer::NativePtr,
    types::TypeHandle,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::{
    fmt::{self, Debug, Formatter},
    mem::size_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const WORD: usize = size_of::<usize>();

struct ValueStorage {
    /// Word-backed so the field region is pointer aligned.
    words: RwLock<Box<[usize]>>,
    has_type_header: bool,
    field_size: usize,
    pins: AtomicUsize,
}

/// A structured value owned by the managed side. Clones share the same instance.
#[derive(Clone)]
pub struct ManagedValue {
    ty: TypeHandle,
    storage: Arc<ValueStorage>,
}

impl ManagedValue {
    fn with_storage(ty: &TypeHandle, field_size: usize, has_type_header: bool) -> Self {
        let header_words = usize::from(has_type_header);
        let mut words = vec![0usize; header_words + field_size.div_ceil(WORD)].into_boxed_slice();
        if has_type_header {
            words[0] = ty.type_id();
        }
        Self {
            ty: ty.clone(),
            storage: Arc::new(ValueStorage {
                words: RwLock::new(words),
                has_type_header,
                field_size,
                pins: AtomicUsize::new(0),
            }),
        }
    }

    /// A boxed instance: a type-identity word followed by the fields.
    pub fn new_boxed(ty: &TypeHandle, field_size: usize) -> Self {
        Self::with_storage(ty, field_size, true)
    }

    /// A bare instance whose fields start at the beginning of its storage.
    pub fn new_unboxed(ty: &TypeHandle, field_size: usize) -> Self {
        Self::with_storage(ty, field_size, false)
    }

    /// A zeroed instance sized from the type's layout; value types are boxed.
    pub fn instantiate(ty: &TypeHandle) -> Self {
        let size = ty.definition().layout.size();
        if ty.is_value_type() {
            Self::new_boxed(ty, size)
        } else {
            Self::new_unboxed(ty, size)
        }
    }

    pub fn type_handle(&self) -> &TypeHandle {
        &self.ty
    }

    /// Whether the storage carries a hidden type-identity word in front of the fields.
    pub fn has_type_header(&self) -> bool {
        self.storage.has_type_header
    }

    /// Offset of the first field, in pointer-sized units.
    pub fn field_start_displacement(&self) -> usize {
        usize::from(self.storage.has_type_header)
    }

    pub fn field_size(&self) -> usize {
        self.storage.field_size
    }

    pub fn header_word(&self) -> Option<usize> {
        self.has_type_header().then(|| self.storage.words.read()[0])
    }

    pub fn same_instance(&self, other: &ManagedValue) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn is_pinned(&self) -> bool {
        self.storage.pins.load(Ordering::Acquire) > 0
    }

    fn check_range(&self, offset: usize, len: usize) -> MarshalResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.storage.field_size => Ok(()),
            _ => Err(MarshalError::out_of_range(
                "offset",
                format!(
                    "{} bytes at {} exceed the {} byte field region of '{}'",
                    len,
                    offset,
                    self.storage.field_size,
                    self.ty.name()
                ),
            )),
        }
    }

    pub fn read_field_bytes(&self, offset: usize, len: usize) -> MarshalResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let words = self.storage.words.read();
        let base = words.as_ptr() as *const u8;
        let start = self.field_start_displacement() * WORD + offset;
        // SAFETY: range checked against the field region, which lies inside `words`.
        Ok(unsafe { std::slice::from_raw_parts(base.add(start), len) }.to_vec())
    }

    /// All field bytes, header excluded.
    pub fn fields(&self) -> Vec<u8> {
        self.read_field_bytes(0, self.storage.field_size)
            .unwrap_or_default()
    }

    pub fn write_field_bytes(&self, offset: usize, bytes: &[u8]) -> MarshalResult<()> {
        self.check_range(offset, bytes.len())?;
        let mut words = self.storage.words.write();
        let base = words.as_mut_ptr() as *mut u8;
        let start = self.field_start_displacement() * WORD + offset;
        // SAFETY: as in `read_field_bytes`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), bytes.len());
        }
        Ok(())
    }

    /// Moves the instance to fresh storage, as a compacting collector would. Refused while
    /// the value is pinned.
    pub fn try_relocate(&self) -> bool {
        if self.is_pinned() {
            return false;
        }
        let Some(mut words) = self.storage.words.try_write() else {
            return false;
        };
        let moved = words.to_vec().into_boxed_slice();
        *words = moved;
        true
    }

    /// Pins the instance until the guard is dropped. The storage cannot be read, written or
    /// relocated through this handle or its clones meanwhile.
    pub fn pin(&self) -> PinGuard<'_> {
        let words = self.storage.words.write();
        self.storage.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            words,
            pins: &self.storage.pins,
        }
    }
}

impl Debug for ManagedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {:?}",
            if self.has_type_header() { "boxed " } else { "" },
            self.ty.name(),
            self.fields()
        )
    }
}

/// Keeps a value's storage in place. Dropping it unpins.
pub struct PinGuard<'a> {
    words: RwLockWriteGuard<'a, Box<[usize]>>,
    pins: &'a AtomicUsize,
}

impl PinGuard<'_> {
    /// Start of the storage, header word included.
    pub fn base(&mut self) -> NativePtr {
        NativePtr::new(self.words.as_mut_ptr() as *mut u8)
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gives a callback a stable address for a managed value for the callback's duration.
pub trait PinningService: Send + Sync {
    fn with_pinned(
        &self,
        value: &ManagedValue,
        f: &mut dyn FnMut(NativePtr) -> MarshalResult<()>,
    ) -> MarshalResult<()>;
}

/// Pins by holding the value's storage lock, which also excludes relocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPinning;

impl PinningService for DefaultPinning {
    fn with_pinned(
        &self,
        value: &ManagedValue,
        f: &mut dyn FnMut(NativePtr) -> MarshalResult<()>,
    ) -> MarshalResult<()> {
        let mut guard = value.pin();
        let base = guard.base();
        tracing::trace!("pinned {} at {:?}", value.type_handle().name(), base);
        f(base)
    }
}
