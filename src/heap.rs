use crate::{
    error::{MarshalError, MarshalResult},
    pointer::NativePtr,
};
use std::{
    alloc::{self, Layout},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Raw native memory, as handed to foreign code.
pub trait NativeAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> MarshalResult<NativePtr>;

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    unsafe fn free(&self, ptr: NativePtr);

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. On success the old
    /// pointer is no longer valid.
    unsafe fn realloc(&self, ptr: NativePtr, size: usize) -> MarshalResult<NativePtr>;
}

// Size header in front of every block; two words keeps the payload 16-byte aligned.
const HEADER: usize = 16;
const ALIGN: usize = 16;

/// Task-memory style heap over the global allocator. Blocks carry their size so `free`
/// needs only the address. Memory is zeroed on allocation.
#[derive(Debug, Default)]
pub struct CoTaskMemHeap {
    live: AtomicUsize,
}

impl CoTaskMemHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks allocated and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn block_layout(size: usize) -> MarshalResult<Layout> {
        size.checked_add(HEADER)
            .and_then(|total| Layout::from_size_align(total, ALIGN).ok())
            .ok_or(MarshalError::OutOfMemory(size))
    }

    unsafe fn header_of(ptr: NativePtr) -> *mut u8 {
        ptr.as_ptr().sub(HEADER)
    }
}

impl NativeAllocator for CoTaskMemHeap {
    fn alloc(&self, size: usize) -> MarshalResult<NativePtr> {
        let layout = Self::block_layout(size)?;
        // SAFETY: layout has non-zero size because of the header.
        let block = unsafe { alloc::alloc_zeroed(layout) };
        if block.is_null() {
            return Err(MarshalError::OutOfMemory(size));
        }
        unsafe {
            ptr::write(block as *mut usize, size);
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(NativePtr::new(unsafe { block.add(HEADER) }))
    }

    unsafe fn free(&self, ptr: NativePtr) {
        if ptr.is_null() {
            return;
        }
        let block = Self::header_of(ptr);
        let size = ptr::read(block as *const usize);
        // the layout was valid when the block was allocated
        let layout = Layout::from_size_align_unchecked(size + HEADER, ALIGN);
        alloc::dealloc(block, layout);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    unsafe fn realloc(&self, ptr: NativePtr, size: usize) -> MarshalResult<NativePtr> {
        if ptr.is_null() {
            return self.alloc(size);
        }
        let new_layout = Self::block_layout(size)?;
        let block = Self::header_of(ptr);
        let old_size = ptr::read(block as *const usize);
        let old_layout = Layout::from_size_align_unchecked(old_size + HEADER, ALIGN);
        let grown = alloc::realloc(block, old_layout, new_layout.size());
        if grown.is_null() {
            return Err(MarshalError::OutOfMemory(size));
        }
        ptr::write(grown as *mut usize, size);
        if size > old_size {
            ptr::write_bytes(grown.add(HEADER + old_size), 0, size - old_size);
        }
        Ok(NativePtr::new(grown.add(HEADER)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_tracked() {
        let heap = CoTaskMemHeap::new();
        let p = heap.alloc(32).unwrap();
        assert!(p.is_aligned_to(16));
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(heap.live_allocations(), 1);
        unsafe { heap.free(p) };
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn zero_sized_alloc_gets_a_block() {
        let heap = CoTaskMemHeap::new();
        let p = heap.alloc(0).unwrap();
        assert!(!p.is_null());
        unsafe { heap.free(p) };
    }

    #[test]
    fn free_null_is_a_no_op() {
        let heap = CoTaskMemHeap::new();
        unsafe { heap.free(NativePtr::NULL) };
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn realloc_preserves_contents() {
        let heap = CoTaskMemHeap::new();
        let p = heap.alloc(4).unwrap();
        unsafe {
            ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), p.as_ptr(), 4);
            let q = heap.realloc(p, 64).unwrap();
            let bytes = std::slice::from_raw_parts(q.as_ptr(), 8);
            assert_eq!(bytes, &[1, 2, 3, 4, 0, 0, 0, 0]);
            heap.free(q);
        }
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn huge_alloc_reports_out_of_memory() {
        let heap = CoTaskMemHeap::new();
        assert_eq!(
            heap.alloc(usize::MAX).unwrap_err(),
            MarshalError::OutOfMemory(usize::MAX)
        );
    }
}
