//! Per-thread suppression of instrumentation.
//!
//! Anything the tracker does internally (growing a table, walking the stack,
//! writing a report) may call back into the shadowed primitives. While a
//! [`SuppressScope`] is live on a thread, those nested calls see
//! [`SuppressScope::enter()`] fail and go straight to the real backend.

use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static PENDING_GPU_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// RAII marker for "this thread is inside the tracker".
pub struct SuppressScope(());

impl SuppressScope {
    /// Enter the tracker. Returns `None` if this thread is already inside it,
    /// in which case the caller must forward to the real primitive untracked.
    #[inline(always)]
    pub fn enter() -> Option<Self> {
        DEPTH.with(|depth| {
            if depth.get() != 0 {
                return None;
            }
            depth.set(1);
            Some(Self(()))
        })
    }

    /// Enter unconditionally, nesting if needed. Used by paths that must run
    /// regardless (initialization, finalize) but whose own allocations must
    /// not be tracked.
    pub fn force() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }

    /// Is the calling thread currently inside the tracker?
    pub fn active() -> bool {
        DEPTH.with(|depth| depth.get() != 0)
    }
}

impl Drop for SuppressScope {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Mark the calling thread as having just asked a GPU driver for memory. The
/// next map call on this thread is the CPU view of that buffer.
pub fn mark_pending_gpu_alloc() {
    PENDING_GPU_ALLOC.with(|pending| pending.set(true));
}

/// Consume the pending GPU allocation mark, returning whether it was set.
pub fn take_pending_gpu_alloc() -> bool {
    PENDING_GPU_ALLOC.with(|pending| pending.replace(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_enter_is_refused() {
        let outer = SuppressScope::enter().expect("thread starts outside the tracker");
        assert!(SuppressScope::active());
        assert!(SuppressScope::enter().is_none());
        drop(outer);
        assert!(!SuppressScope::active());
        assert!(SuppressScope::enter().is_some());
    }

    #[test]
    fn forced_scopes_nest() {
        let a = SuppressScope::force();
        let b = SuppressScope::force();
        assert!(SuppressScope::enter().is_none());
        drop(b);
        assert!(SuppressScope::active());
        drop(a);
        assert!(!SuppressScope::active());
    }

    #[test]
    fn gpu_mark_is_consumed_once_and_per_thread() {
        mark_pending_gpu_alloc();
        std::thread::spawn(|| assert!(!take_pending_gpu_alloc()))
            .join()
            .unwrap();
        assert!(take_pending_gpu_alloc());
        assert!(!take_pending_gpu_alloc());
    }
}
