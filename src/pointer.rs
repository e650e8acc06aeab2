use std::{
    ffi::c_void,
    fmt::{self, Debug, Formatter},
    ptr::{self, NonNull},
};

/// Address of a native buffer. May be null; operations that need a buffer check it.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NativePtr(*mut u8);

// SAFETY: a NativePtr is an address; every dereference happens in `unsafe` code whose caller
// vouches for the buffer.
unsafe impl Send for NativePtr {}
unsafe impl Sync for NativePtr {}

impl NativePtr {
    pub const NULL: NativePtr = NativePtr(ptr::null_mut());

    pub fn new(p: *mut u8) -> Self {
        Self(p)
    }

    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self(buf.as_mut_ptr())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    pub fn as_void(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn non_null(self) -> Option<NonNull<u8>> {
        NonNull::new(self.0)
    }

    pub fn address(self) -> usize {
        self.0 as usize
    }

    pub fn is_aligned_to(self, align: usize) -> bool {
        align <= 1 || (self.0 as usize) % align == 0
    }

    /// # Safety
    ///
    /// The result must stay within the allocation `self` points into.
    pub unsafe fn byte_add(self, count: usize) -> Self {
        Self(self.0.add(count))
    }
}

impl Debug for NativePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0 as usize)
    }
}
