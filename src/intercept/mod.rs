//! The shadowed primitives, expressed against injected backends.
//!
//! Every method follows the same shape: enter the tracker (a per-thread
//! suppression scope plus the shared side of the gate), call the real
//! primitive, and account for the result. If the tracker cannot be entered,
//! because this call came from inside the tracker or because teardown closed
//! the gate, the call is forwarded untouched.

pub mod ioctl;

use std::{
    ffi::c_void,
    mem,
    path::{Path, PathBuf},
    ptr,
    time::SystemTime,
};

use libc::{c_int, c_ulong, off_t, size_t};

use crate::{
    alloc::{
        capture::ExitBoundary,
        pointers::{AllocationRecord, Category, Counters, Identity},
        Tracker,
    },
    config::Policy,
    error::ReportError,
    intercept::ioctl::Request,
    os::{DescriptorProbe, RealBackend},
    report::report_path,
    sync::{
        reentrancy::{mark_pending_gpu_alloc, take_pending_gpu_alloc},
        Gate, ReadGuard, SuppressScope,
    },
    util::print::{errno, set_errno},
};

/// Proof that the calling thread is inside the tracker. Field order matters:
/// the gate is released before the thread leaves its suppression scope.
struct Session<'a> {
    _guard: ReadGuard<'a>,
    _scope: SuppressScope,
}

/// `posix_memalign()` on top of a `memalign()`: validate the alignment, keep
/// the caller's errno, and report failure by return value.
///
/// # Safety
/// `out` must be valid for writes when the allocation succeeds.
pub unsafe fn posix_memalign_with(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
    memalign: impl FnOnce(size_t, size_t) -> *mut c_void,
) -> c_int {
    if !align.is_power_of_two() || align < mem::size_of::<*mut c_void>() {
        return libc::EINVAL;
    }
    let saved = errno();
    let ptr = memalign(align, size);
    set_errno(saved);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *out = ptr;
    0
}

/// Everything the hooks need, built once per process.
pub struct Context<B, P> {
    backend: B,
    probe: P,
    tracker: Tracker,
    gate: Gate,
}

impl<B: RealBackend, P: DescriptorProbe> Context<B, P> {
    /// Does not allocate.
    pub fn new(policy: Policy, boundary: ExitBoundary, backend: B, probe: P) -> Self {
        Self {
            backend,
            probe,
            tracker: Tracker::new(policy, boundary),
            gate: Gate::new(),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn policy(&self) -> &Policy {
        self.tracker.policy()
    }

    fn enter(&self) -> Option<Session<'_>> {
        let scope = SuppressScope::enter()?;
        let guard = self.gate.read()?;
        Some(Session {
            _guard: guard,
            _scope: scope,
        })
    }

    fn oversize(&self, size: usize) -> bool {
        size > self.policy().max_tracked_size
    }

    fn track_host(&self, ptr: *mut c_void, size: usize) {
        if !ptr.is_null() {
            self.tracker
                .track(Identity::Address(ptr as usize), size, Category::Host);
        }
    }

    /// Stop tracking `identity`, giving back its dma-buf claim if it had one.
    fn forget(&self, identity: Identity) {
        if let Some(record) = self.tracker.detach(identity) {
            self.release(record);
        }
    }

    fn release(&self, record: AllocationRecord) {
        if record.category.is_dma() {
            self.probe.release(record.identity);
        }
        self.tracker.release(record);
    }

    pub unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        let Some(_session) = self.enter() else {
            return self.backend.malloc(size);
        };
        if self.oversize(size) {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        let ptr = self.backend.malloc(size);
        self.track_host(ptr, size);
        ptr
    }

    pub unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        let Some(_session) = self.enter() else {
            return self.backend.calloc(n, size);
        };
        let Some(total) = n.checked_mul(size).filter(|&total| !self.oversize(total)) else {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        };
        let ptr = self.backend.calloc(n, size);
        self.track_host(ptr, total);
        ptr
    }

    pub unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        if ptr.is_null() {
            return self.malloc(size);
        }
        let Some(_session) = self.enter() else {
            return self.backend.realloc(ptr, size);
        };
        if size == 0 {
            self.forget(Identity::Address(ptr as usize));
            self.backend.free(ptr);
            return ptr::null_mut();
        }
        if self.oversize(size) {
            // The old block stays valid, and tracked.
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        // The old address may be handed out again, even to another thread,
        // before the real call returns: it must be gone from the table first.
        let old = self.tracker.detach(Identity::Address(ptr as usize));
        let new = self.backend.realloc(ptr, size);
        if new.is_null() {
            // The old block is still live
            if let Some(record) = old {
                self.tracker.reattach(record);
            }
            return new;
        }
        if let Some(record) = old {
            self.release(record);
        }
        self.track_host(new, size);
        new
    }

    pub unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        let Some(_session) = self.enter() else {
            return self.backend.memalign(align, size);
        };
        if self.oversize(size) {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        let ptr = self.backend.memalign(align, size);
        self.track_host(ptr, size);
        ptr
    }

    pub unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        let Some(_session) = self.enter() else {
            return self.backend.aligned_alloc(align, size);
        };
        if self.oversize(size) {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        let ptr = self.backend.aligned_alloc(align, size);
        self.track_host(ptr, size);
        ptr
    }

    /// Returns an errno value rather than setting `errno`, which is left as
    /// the caller had it.
    pub unsafe fn posix_memalign(
        &self,
        out: *mut *mut c_void,
        align: size_t,
        size: size_t,
    ) -> c_int {
        posix_memalign_with(out, align, size, |align, size| self.memalign(align, size))
    }

    pub unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return self.backend.free(ptr);
        }
        if let Some(_session) = self.enter() {
            // Forget before the address can be handed out again.
            self.forget(Identity::Address(ptr as usize));
        }
        self.backend.free(ptr)
    }

    pub unsafe fn mmap(
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

    pub unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        if !addr.is_null() {
            // Placement maps (guard pages, loader segments) are not allocations
            return self.backend.mmap64(addr, len, prot, flags, fd, offset);
        }
        let Some(_session) = self.enter() else {
            return self.backend.mmap64(addr, len, prot, flags, fd, offset);
        };
        let gpu = take_pending_gpu_alloc();
        if self.oversize(len) {
            set_errno(libc::ENOMEM);
            return libc::MAP_FAILED;
        }
        let mapped = self.backend.mmap64(addr, len, prot, flags, fd, offset);
        if mapped == libc::MAP_FAILED {
            return mapped;
        }

        let identity = Identity::Address(mapped as usize);
        if gpu {
            self.tracker.track(identity, len, Category::Dma);
        } else if fd < 0 {
            self.tracker.track(identity, len, Category::Mmap);
        } else if self.probe.claim(fd, identity).is_some()
            && !self.tracker.track(identity, len, Category::Dma)
        {
            self.probe.release(identity);
        }
        mapped
    }

    pub unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int {
        if let Some(_session) = self.enter() {
            self.forget(Identity::Address(addr as usize));
        }
        self.backend.munmap(addr, len)
    }

    pub unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        let kind = Request::classify(request);
        if kind == Request::Other {
            return self.backend.ioctl(fd, request, arg);
        }
        let Some(_session) = self.enter() else {
            return self.backend.ioctl(fd, request, arg);
        };
        let rc = self.backend.ioctl(fd, request, arg);
        if rc != 0 {
            return rc;
        }
        match kind {
            Request::GpuAlloc => mark_pending_gpu_alloc(),
            Request::DescriptorAlloc(alloc) => {
                if let Some(buf) = alloc.read(arg) {
                    let identity = Identity::Descriptor(buf.fd);
                    if let Some(dma) = self.probe.claim(buf.fd, identity) {
                        let size = dma.size.unwrap_or(buf.len);
                        if !self.tracker.track(identity, size, Category::Dma) {
                            self.probe.release(identity);
                        }
                    }
                }
            }
            Request::Other => {}
        }
        rc
    }

    pub unsafe fn close(&self, fd: c_int) -> c_int {
        if let Some(_session) = self.enter() {
            self.forget(Identity::Descriptor(fd));
        }
        self.backend.close(fd)
    }

    /// Write a report to `path` now. Returns `Ok(false)` without writing
    /// anything when the calling thread is already inside the tracker (a
    /// signal landed in the middle of a hook) or the gate is closed.
    pub fn dump(&self, path: &Path) -> Result<bool, ReportError> {
        let Some(_session) = self.enter() else {
            return Ok(false);
        };
        self.write_report(path)?;
        Ok(true)
    }

    /// [`Context::dump()`] to a fresh `<prefix>.<kind>.<secs>.txt`, built
    /// inside the tracker so that the path itself is not tracked.
    pub fn dump_tagged(&self, kind: &str) -> Result<Option<PathBuf>, ReportError> {
        let Some(_session) = self.enter() else {
            return Ok(None);
        };
        let path = report_path(&self.policy().dump_prefix, kind, SystemTime::now());
        self.write_report(&path)?;
        Ok(Some(path))
    }

    fn write_report(&self, path: &Path) -> Result<(), ReportError> {
        let report = self.tracker.report();
        report.save(path, self.policy().report_format)
    }

    /// Quiesce every hook, optionally write a final report, and close the
    /// gate for good. Returns the counters as they stood at the end. Nothing
    /// is freed: the tables are left for the OS.
    pub fn shutdown(&self, exit_report: Option<&Path>) -> Counters {
        let _scope = SuppressScope::force();
        let writer = self.gate.write();
        if let Some(path) = exit_report {
            if let Err(err) = self.write_report(path) {
                log::error!("exit report failed: {err}");
            }
        }
        let counters = self.tracker.counters();
        writer.close();
        counters
    }

    pub fn is_shut_down(&self) -> bool {
        self.gate.is_closed()
    }
}
