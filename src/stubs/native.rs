use crate::pointer::NativePtr;
use libffi::middle::{Arg, Cif, CodePtr, Type};
use std::{
    ffi::c_void,
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// `int32 stub(void* src, void* dst)`: marshal and unmarshal stubs.
pub type MarshalStubFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> i32;
/// `int32 stub(void* buffer)`: destroy stubs.
pub type DestroyStubFn = unsafe extern "C" fn(*mut c_void) -> i32;

pub const STUB_SUCCESS: i32 = 0;

/// Entry point of an ahead-of-time generated stub.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeStub(NonNull<c_void>);

// SAFETY: a code address; stubs are required to be callable from any thread.
unsafe impl Send for NativeStub {}
unsafe impl Sync for NativeStub {}

impl NativeStub {
    pub fn from_fun(f: unsafe extern "C" fn()) -> Self {
        // SAFETY: function pointers are never null.
        Self(unsafe { NonNull::new_unchecked(f as *mut c_void) })
    }

    pub fn marshal(f: MarshalStubFn) -> Self {
        Self(unsafe { NonNull::new_unchecked(f as *mut c_void) })
    }

    pub fn destroy(f: DestroyStubFn) -> Self {
        Self(unsafe { NonNull::new_unchecked(f as *mut c_void) })
    }

    /// # Safety
    ///
    /// `address` must be null or the entry point of a function with the stub calling
    /// convention matching how it will be invoked.
    pub unsafe fn from_address(address: *mut c_void) -> Option<Self> {
        NonNull::new(address).map(Self)
    }

    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn code_ptr(&self) -> CodePtr {
        // SAFETY: the address was produced from a function pointer or a resolved symbol.
        let fun = unsafe {
            std::mem::transmute::<*mut c_void, unsafe extern "C" fn()>(self.0.as_ptr())
        };
        CodePtr::from_fun(fun)
    }

    /// Calls a marshal or unmarshal stub.
    ///
    /// # Safety
    ///
    /// The stub must have the [`MarshalStubFn`] signature and both buffers must be valid
    /// for what the stub reads and writes.
    pub unsafe fn call_marshal(&self, src: NativePtr, dst: NativePtr) -> i32 {
        let cif = Cif::new(vec![Type::pointer(), Type::pointer()], Type::i32());
        let src = src.as_void();
        let dst = dst.as_void();
        cif.call::<i32>(self.code_ptr(), &[Arg::new(&src), Arg::new(&dst)])
    }

    /// Calls a destroy stub.
    ///
    /// # Safety
    ///
    /// The stub must have the [`DestroyStubFn`] signature and `buffer` must hold a value
    /// previously written by the matching marshal stub (or zeroed memory).
    pub unsafe fn call_destroy(&self, buffer: NativePtr) -> i32 {
        let cif = Cif::new(vec![Type::pointer()], Type::i32());
        let buffer = buffer.as_void();
        cif.call::<i32>(self.code_ptr(), &[Arg::new(&buffer)])
    }
}

impl Debug for NativeStub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NativeStub({:#x})", self.address())
    }
}
