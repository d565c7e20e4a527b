use std::{
    cell::UnsafeCell,
    mem, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::util::num::round_up;

/// Every arena block is preceded by a header this big, which keeps blocks
/// 16-byte aligned and leaves room for the block size.
const HEADER: usize = 16;

#[repr(C, align(16))]
struct Bytes<const N: usize>(UnsafeCell<[u8; N]>);

/// A bump allocator over a fixed, static buffer. This is what serves heap
/// requests while the real allocator is still being looked up (the dynamic
/// loader allocates during `dlsym()`).
///
/// `deallocate()` does not exist: blocks are never reused and the arena is
/// never reset. Each block records its own size so that a `realloc()` out of
/// the arena knows how much to copy.
pub struct BootstrapArena<const N: usize> {
    bytes: Bytes<N>,
    sp: AtomicUsize,
}

// SAFETY: blocks are handed out disjointly through the atomic `sp`, so no two
// callers ever touch the same bytes.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            bytes: Bytes(UnsafeCell::new([0; N])),
            sp: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> usize {
        self.bytes.0.get() as usize
    }

    /// Bump out `size` bytes aligned to `align` (a power of two). Returns null
    /// once the arena is exhausted.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        let align = align.max(HEADER);
        let base = self.base();
        let mut sp = self.sp.load(Ordering::Relaxed);
        loop {
            let data = round_up(base + sp + HEADER, align);
            let end = match (data - base).checked_add(size) {
                Some(end) if end <= N => end,
                _ => return ptr::null_mut(),
            };
            match self
                .sp
                .compare_exchange_weak(sp, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let data = data as *mut u8;
                    // SAFETY: `data - HEADER >= base + sp` lies inside the block
                    // we just claimed, and is aligned for a usize.
                    unsafe { data.sub(mem::size_of::<usize>()).cast::<usize>().write(size) };
                    return data;
                }
                Err(current) => sp = current,
            }
        }
    }

    /// Was `ptr` handed out by this arena?
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base();
        addr >= base + HEADER && addr < base + N
    }

    /// The requested size of an arena block.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`BootstrapArena::allocate()`] on this
    /// arena.
    pub unsafe fn size_of(&self, ptr: *const u8) -> usize {
        ptr.sub(mem::size_of::<usize>()).cast::<usize>().read()
    }

    /// Bytes handed out so far, headers and padding included.
    pub fn used(&self) -> usize {
        self.sp.load(Ordering::Relaxed)
    }
}
