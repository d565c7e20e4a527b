//! The C symbols that shadow libc once this object is preloaded.
//!
//! Every export looks up the process context and hands the call to it. Until
//! the context exists (or if initialization failed) the call goes straight to
//! the real primitive.

use std::{
    ffi::{c_char, CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use libc::{c_int, c_ulong, c_void, off_t, size_t};

use crate::{
    intercept::posix_memalign_with,
    lifecycle::{self, context},
    os::{LibcBackend, RealBackend},
};

#[ctor::ctor]
fn on_load() {
    lifecycle::end_pre_init();
    // A failure has already been logged and leaves every hook a pass-through.
    _ = lifecycle::initialize();
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    match context() {
        Some(ctx) => ctx.malloc(size),
        None => LibcBackend.malloc(size),
    }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    match context() {
        Some(ctx) => ctx.free(ptr),
        None => LibcBackend.free(ptr),
    }
}

#[no_mangle]
pub unsafe extern "C" fn calloc(n: size_t, size: size_t) -> *mut c_void {
    match context() {
        Some(ctx) => ctx.calloc(n, size),
        None => LibcBackend.calloc(n, size),
    }
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    match context() {
        Some(ctx) => ctx.realloc(ptr, size),
        None => LibcBackend.realloc(ptr, size),
    }
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    match context() {
        Some(ctx) => ctx.memalign(align, size),
        None => LibcBackend.memalign(align, size),
    }
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    match context() {
        Some(ctx) => ctx.aligned_alloc(align, size),
        None => LibcBackend.aligned_alloc(align, size),
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    match context() {
        Some(ctx) => ctx.posix_memalign(out, align, size),
        None => posix_memalign_with(out, align, size, |align, size| {
            LibcBackend.memalign(align, size)
        }),
    }
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    if lifecycle::in_pre_init() {
        return LibcBackend.mmap(addr, len, prot, flags, fd, offset);
    }
    match context() {
        Some(ctx) => ctx.mmap(addr, len, prot, flags, fd, offset),
        None => LibcBackend.mmap(addr, len, prot, flags, fd, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: i64,
) -> *mut c_void {
    if lifecycle::in_pre_init() {
        return LibcBackend.mmap64(addr, len, prot, flags, fd, offset);
    }
    match context() {
        Some(ctx) => ctx.mmap64(addr, len, prot, flags, fd, offset),
        None => LibcBackend.mmap64(addr, len, prot, flags, fd, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: size_t) -> c_int {
    if lifecycle::in_pre_init() {
        return LibcBackend.munmap(addr, len);
    }
    match context() {
        Some(ctx) => ctx.munmap(addr, len),
        None => LibcBackend.munmap(addr, len),
    }
}

/// `ioctl()` is variadic in C, but every request we forward carries at most
/// one pointer-sized argument, which the Linux calling conventions pass the
/// same way as a named parameter.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    match context() {
        Some(ctx) => ctx.ioctl(fd, request, arg),
        None => LibcBackend.ioctl(fd, request, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match context() {
        Some(ctx) => ctx.close(fd),
        None => LibcBackend.close(fd),
    }
}

/// Write a report for the running process to `path`. Returns 0 on success and
/// -1 if nothing was written.
#[no_mangle]
pub unsafe extern "C" fn checkpoint(path: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    let path = Path::new(OsStr::from_bytes(CStr::from_ptr(path).to_bytes()));
    if lifecycle::checkpoint(path) {
        0
    } else {
        -1
    }
}
