//! The real primitives the hooks forward to.
//!
//! Once this crate is preloaded, `malloc` & co. resolve to *our* exports, so
//! nothing in here may call them by name. The heap functions are looked up
//! behind us with `dlsym(RTLD_NEXT, ...)`; everything that is a plain system
//! call is issued with `syscall(2)` directly.

use std::{
    ffi::{c_void, CStr},
    mem, ptr,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use libc::{c_int, c_ulong, off_t, size_t};

use crate::{os::mem::BootstrapArena, util::print::set_errno};

/// The primitives being shadowed, as the process would have seen them without
/// us. Implementations must not route back into the hooks.
pub trait RealBackend: Send + Sync {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void;
    unsafe fn free(&self, ptr: *mut c_void);
    unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void;
    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void;
    unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void;
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void;
    /// `mmap()` with a 64-bit file offset, whatever the width of `off_t`.
    unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        match off_t::try_from(offset) {
            Ok(offset) => self.mmap(addr, len, prot, flags, fd, offset),
            Err(_) => {
                set_errno(libc::EOVERFLOW);
                libc::MAP_FAILED
            }
        }
    }
    unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int;
    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int;
    unsafe fn close(&self, fd: c_int) -> c_int;
}

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Resolution {
    Unresolved,
    Resolving,
    Resolved,
}

/// Addresses of the next object's heap functions. Each slot is resolved on
/// its own: zero means that one symbol is missing, and calls to it fall back
/// to a sibling function. The arena only serves heap calls made while the
/// lookup is still running.
struct Symbols {
    state: AtomicU8,
    malloc: AtomicUsize,
    free: AtomicUsize,
    calloc: AtomicUsize,
    realloc: AtomicUsize,
    memalign: AtomicUsize,
    aligned_alloc: AtomicUsize,
}

const ARENA_SIZE: usize = 64 * 1024;

static SYMBOLS: Symbols = Symbols::new();

static ARENA: BootstrapArena<ARENA_SIZE> = BootstrapArena::new();

fn next_symbol(name: &CStr) -> usize {
    // SAFETY: `name` is NUL-terminated
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) as usize }
}

fn arena_alloc(size: size_t, align: size_t) -> *mut c_void {
    let ptr = ARENA.allocate(size, align);
    if ptr.is_null() {
        set_errno(libc::ENOMEM);
    }
    ptr.cast()
}

fn enomem() -> *mut c_void {
    set_errno(libc::ENOMEM);
    ptr::null_mut()
}

fn resolved(slot: &AtomicUsize) -> Option<usize> {
    match slot.load(Ordering::Relaxed) {
        0 => None,
        addr => Some(addr),
    }
}

// The `transmute`s below turn a resolved, non-zero symbol address back into a
// function pointer of the documented C signature.
impl Symbols {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(Resolution::Unresolved as u8),
            malloc: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            calloc: AtomicUsize::new(0),
            realloc: AtomicUsize::new(0),
            memalign: AtomicUsize::new(0),
            aligned_alloc: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> Resolution {
        match self.state.load(Ordering::Acquire) {
            0 => Resolution::Unresolved,
            1 => Resolution::Resolving,
            _ => Resolution::Resolved,
        }
    }

    /// Make sure the lookup has run, running it on the first call. Returns
    /// `false` while it is in flight (on this or another thread), in which
    /// case the caller must use the bootstrap arena.
    #[inline(always)]
    fn ensure_resolved(&self) -> bool {
        match self.state() {
            Resolution::Resolved => true,
            Resolution::Resolving => false,
            Resolution::Unresolved => self.resolve_with(next_symbol),
        }
    }

    #[cold]
    fn resolve_with(&self, lookup: impl Fn(&CStr) -> usize) -> bool {
        if self
            .state
            .compare_exchange(
                Resolution::Unresolved as u8,
                Resolution::Resolving as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.state() == Resolution::Resolved;
        }
        let slots = [
            (&self.malloc, c"malloc"),
            (&self.free, c"free"),
            (&self.calloc, c"calloc"),
            (&self.realloc, c"realloc"),
            (&self.memalign, c"memalign"),
            (&self.aligned_alloc, c"aligned_alloc"),
        ];
        for (slot, name) in slots {
            slot.store(lookup(name), Ordering::Relaxed);
        }
        self.state
            .store(Resolution::Resolved as u8, Ordering::Release);
        true
    }

    /// Names of the heap functions the lookup did not find.
    fn missing(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            (&self.malloc, "malloc"),
            (&self.free, "free"),
            (&self.calloc, "calloc"),
            (&self.realloc, "realloc"),
            (&self.memalign, "memalign"),
            (&self.aligned_alloc, "aligned_alloc"),
        ]
        .into_iter()
        .filter(|(slot, _)| resolved(slot).is_none())
        .map(|(_, name)| name)
    }

    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        if !self.ensure_resolved() {
            return arena_alloc(size, 16);
        }
        match resolved(&self.malloc) {
            Some(addr) => mem::transmute::<usize, MallocFn>(addr)(size),
            None => self.memalign(16, size),
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() || ARENA.owns(ptr.cast()) || !self.ensure_resolved() {
            return;
        }
        // Without a `free()` the block is leaked
        if let Some(addr) = resolved(&self.free) {
            mem::transmute::<usize, FreeFn>(addr)(ptr)
        }
    }

    unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        if !self.ensure_resolved() {
            let Some(total) = n.checked_mul(size) else {
                return enomem();
            };
            // The arena is zero-initialized and never reused.
            return arena_alloc(total, 16);
        }
        if let Some(addr) = resolved(&self.calloc) {
            return mem::transmute::<usize, CallocFn>(addr)(n, size);
        }
        let Some(total) = n.checked_mul(size) else {
            return enomem();
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            ptr.cast::<u8>().write_bytes(0, total);
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        if !ptr.is_null() && ARENA.owns(ptr.cast()) {
            let old_size = ARENA.size_of(ptr.cast());
            let new = self.malloc(size);
            if !new.is_null() {
                ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), old_size.min(size));
            }
            return new;
        }
        if !self.ensure_resolved() {
            return if ptr.is_null() {
                arena_alloc(size, 16)
            } else {
                enomem()
            };
        }
        match resolved(&self.realloc) {
            Some(addr) => mem::transmute::<usize, ReallocFn>(addr)(ptr, size),
            None if ptr.is_null() => self.malloc(size),
            // The old block's size is unknown, so it cannot be moved by hand
            None => enomem(),
        }
    }

    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        if !self.ensure_resolved() {
            return arena_alloc(size, align);
        }
        match (resolved(&self.memalign), resolved(&self.aligned_alloc)) {
            (Some(addr), _) | (None, Some(addr)) => {
                mem::transmute::<usize, MemalignFn>(addr)(align, size)
            }
            (None, None) => enomem(),
        }
    }

    unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        if !self.ensure_resolved() {
            return arena_alloc(size, align);
        }
        // bionic only has `aligned_alloc()` from API level 28
        match (resolved(&self.aligned_alloc), resolved(&self.memalign)) {
            (Some(addr), _) | (None, Some(addr)) => {
                mem::transmute::<usize, MemalignFn>(addr)(align, size)
            }
            (None, None) => enomem(),
        }
    }
}

/// The process's real primitives. Zero-sized: all state lives in statics so
/// that the pre-init pass-through paths can use it before any tracker exists.
#[derive(Clone, Copy, Default)]
pub struct LibcBackend;

impl LibcBackend {
    /// Resolve the heap symbols now rather than on the first heap call.
    /// Returns the names of the ones that are missing.
    pub fn resolve(&self) -> Vec<&'static str> {
        SYMBOLS.ensure_resolved();
        SYMBOLS.missing().collect()
    }

    /// Did `ptr` come from the bootstrap arena?
    pub fn is_bootstrap(&self, ptr: *const c_void) -> bool {
        ARENA.owns(ptr.cast())
    }
}

impl RealBackend for LibcBackend {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        SYMBOLS.malloc(size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        SYMBOLS.free(ptr)
    }

    unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        SYMBOLS.calloc(n, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        SYMBOLS.realloc(ptr, size)
    }

    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        SYMBOLS.memalign(align, size)
    }

    unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        SYMBOLS.aligned_alloc(align, size)
    }

    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        self.mmap64(addr, len, prot, flags, fd, offset.into())
    }

    #[cfg(target_pointer_width = "64")]
    unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        libc::syscall(libc::SYS_mmap, addr, len, prot, flags, fd, offset) as *mut c_void
    }

    #[cfg(target_pointer_width = "32")]
    unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        // mmap2 takes the offset in 4096-byte units, which also keeps offsets
        // past 4GiB reachable
        if offset & 0xfff != 0 {
            set_errno(libc::EINVAL);
            return libc::MAP_FAILED;
        }
        let pages = (offset >> 12) as libc::c_long;
        libc::syscall(libc::SYS_mmap2, addr, len, prot, flags, fd, pages) as *mut c_void
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int {
        libc::syscall(libc::SYS_munmap, addr, len) as c_int
    }

    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        libc::syscall(libc::SYS_ioctl, fd, request, arg) as c_int
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        libc::syscall(libc::SYS_close, fd) as c_int
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[test]
    fn heap_round_trip_through_resolved_symbols() {
        let backend = LibcBackend;
        assert!(backend.resolve().is_empty());
        unsafe {
            let p = backend.malloc(64).cast::<u8>();
            assert!(!p.is_null());
            assert!(!backend.is_bootstrap(p.cast()));
            p.write_bytes(0xAB, 64);
            let p = backend.realloc(p.cast(), 4096).cast::<u8>();
            assert_eq!(*p.add(63), 0xAB);
            backend.free(p.cast());

            let z = backend.calloc(16, 16).cast::<u8>();
            assert!((0..256).all(|i| *z.add(i) == 0));
            backend.free(z.cast());

            let a = backend.memalign(256, 10);
            assert_eq!(a as usize % 256, 0);
            backend.free(a);
        }
    }

    #[test]
    fn realloc_out_of_the_arena_copies() {
        let backend = LibcBackend;
        assert!(backend.resolve().is_empty());
        let old = ARENA.allocate(8, 16);
        assert!(!old.is_null());
        unsafe {
            old.copy_from_nonoverlapping(b"bootstr!".as_ptr(), 8);
            let new = backend.realloc(old.cast(), 32).cast::<u8>();
            assert!(!backend.is_bootstrap(new.cast()));
            assert_eq!(std::slice::from_raw_parts(new, 8), b"bootstr!");
            // Freeing an arena block is a no-op
            backend.free(old.cast());
            backend.free(new.cast());
        }
    }

    fn resolved_without(missing: &'static [&'static str]) -> Symbols {
        let symbols = Symbols::new();
        assert!(symbols.resolve_with(|name| {
            let name = name.to_str().unwrap();
            if missing.contains(&name) {
                0
            } else {
                next_symbol(&CString::new(name).unwrap())
            }
        }));
        symbols
    }

    #[test]
    fn one_missing_symbol_falls_back_to_a_sibling() {
        let symbols = resolved_without(&["aligned_alloc"]);
        assert_eq!(symbols.missing().collect::<Vec<_>>(), ["aligned_alloc"]);
        unsafe {
            // Everything else still reaches the real heap
            for _ in 0..(2 * ARENA_SIZE / 4096) {
                let p = symbols.malloc(4096);
                assert!(!p.is_null());
                assert!(!ARENA.owns(p.cast()));
                symbols.free(p);
            }
            let a = symbols.aligned_alloc(256, 512);
            assert!(!a.is_null());
            assert!(!ARENA.owns(a.cast()));
            assert_eq!(a as usize % 256, 0);
            let a = symbols.realloc(a, 1024);
            assert!(!a.is_null());
            symbols.free(a);
        }
    }

    #[test]
    fn missing_calloc_zeroes_a_malloc_block() {
        let symbols = resolved_without(&["calloc", "memalign"]);
        unsafe {
            let z = symbols.calloc(64, 4).cast::<u8>();
            assert!(!z.is_null());
            assert!((0..256).all(|i| *z.add(i) == 0));
            symbols.free(z.cast());
            let a = symbols.memalign(64, 100);
            assert_eq!(a as usize % 64, 0);
            symbols.free(a);
        }
    }

    #[test]
    fn only_an_in_flight_lookup_uses_the_arena() {
        let symbols = Symbols::new();
        symbols
            .state
            .store(Resolution::Resolving as u8, Ordering::Release);
        unsafe {
            let p = symbols.malloc(32);
            assert!(ARENA.owns(p.cast()));
            // Arena blocks are never handed to the real `free()`
            symbols.free(p);
        }
    }

    #[test]
    fn file_map_at_a_64_bit_offset() {
        use std::{io::Write, os::fd::AsRawFd};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1u8; 4096]).unwrap();
        file.write_all(&[2u8; 4096]).unwrap();
        let backend = LibcBackend;
        unsafe {
            let addr = backend.mmap64(
                ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                4096,
            );
            assert_ne!(addr, libc::MAP_FAILED);
            assert_eq!(*addr.cast::<u8>(), 2);
            backend.munmap(addr, 4096);

            let unaligned = backend.mmap64(
                ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                100,
            );
            assert_eq!(unaligned, libc::MAP_FAILED);
            assert_eq!(crate::util::print::errno(), libc::EINVAL);
        }
    }

    #[test]
    fn anonymous_map_via_syscall() {
        let backend = LibcBackend;
        unsafe {
            let addr = backend.mmap(
                ptr::null_mut(),
                8192,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(addr, libc::MAP_FAILED);
            addr.cast::<u8>().write(1);
            assert_eq!(backend.munmap(addr, 8192), 0);
        }
    }
}
