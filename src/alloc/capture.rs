//! Stack capture for a single allocation.

use std::ffi::{c_void, CStr};

use crate::config::Policy;

/// Outcome of trying to capture the stack behind one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Backtraces are off, or the size is outside the filter. The stack was not
    /// walked.
    Filtered,
    /// The allocation happens on the way out of the process; do not record it
    /// at all.
    NoRecord,
    /// The walk produced no usable frame.
    Empty,
    Frames(Vec<usize>),
}

/// Entry points of the process exit path. Allocations made underneath them
/// are teardown noise and never recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitBoundary {
    addrs: [usize; 3],
}

impl ExitBoundary {
    pub const fn none() -> Self {
        Self { addrs: [0; 3] }
    }

    pub const fn from_addrs(addrs: [usize; 3]) -> Self {
        Self { addrs }
    }

    /// Look up `exit`, `_exit` and `__cxa_finalize` in the running process.
    /// Must run suppressed: `dlsym()` may allocate.
    pub fn resolve() -> Self {
        let lookup = |name: &CStr| -> usize {
            // SAFETY: `name` is NUL-terminated
            unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) as usize }
        };
        Self {
            addrs: [lookup(c"exit"), lookup(c"_exit"), lookup(c"__cxa_finalize")],
        }
    }

    pub fn contains(&self, symbol_address: usize) -> bool {
        symbol_address != 0 && self.addrs.contains(&symbol_address)
    }
}

/// Accumulates one stack walk, frame by frame, outermost last.
pub struct Walk<'a> {
    skip: usize,
    depth: usize,
    boundary: &'a ExitBoundary,
    frames: Vec<usize>,
    exiting: bool,
}

impl<'a> Walk<'a> {
    pub fn new(skip: usize, depth: usize, boundary: &'a ExitBoundary) -> Self {
        Self {
            skip,
            depth,
            boundary,
            frames: Vec::with_capacity(depth.min(64)),
            exiting: false,
        }
    }

    /// Feed one walked frame. Returns whether the walk should continue.
    pub fn push(&mut self, ip: usize, symbol_address: usize) -> bool {
        if self.boundary.contains(symbol_address) {
            self.exiting = true;
            return false;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return true;
        }
        if ip != 0 {
            self.frames.push(ip);
        }
        self.frames.len() < self.depth
    }

    pub fn finish(self) -> Capture {
        if self.exiting {
            Capture::NoRecord
        } else if self.frames.is_empty() {
            Capture::Empty
        } else {
            Capture::Frames(self.frames)
        }
    }
}

/// Classify an already-walked stack given as `(ip, symbol_address)` pairs.
pub fn classify<I>(walked: I, skip: usize, depth: usize, boundary: &ExitBoundary) -> Capture
where
    I: IntoIterator<Item = (usize, usize)>,
{
    let mut walk = Walk::new(skip, depth, boundary);
    for (ip, symbol_address) in walked {
        if !walk.push(ip, symbol_address) {
            break;
        }
    }
    walk.finish()
}

/// Capture the current stack for an allocation of `size` bytes.
pub fn capture(policy: &Policy, size: usize, boundary: &ExitBoundary) -> Capture {
    if !policy.wants_backtrace(size) || policy.backtrace_frames == 0 {
        return Capture::Filtered;
    }
    let mut walk = Walk::new(policy.skip_frames, policy.backtrace_frames, boundary);
    // SAFETY: the unwinder is thread-safe on every target we build for; the
    // synchronized `trace()` would take a lock that can re-enter the hooks.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            walk.push(
                frame.ip() as usize,
                frame.symbol_address() as *const c_void as usize,
            )
        });
    }
    walk.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXIT: usize = 0x7000;

    fn boundary() -> ExitBoundary {
        ExitBoundary::from_addrs([EXIT, 0x7100, 0])
    }

    #[test]
    fn skips_leading_frames_and_stops_at_depth() {
        let walked = (1..=10).map(|i| (i * 0x10, i * 0x10 - 4));
        let capture = classify(walked, 2, 3, &boundary());
        assert_eq!(capture, Capture::Frames(vec![0x30, 0x40, 0x50]));
    }

    #[test]
    fn exit_boundary_means_no_record() {
        let walked = [(0x10, 0x8), (0x20, 0x18), (0x7010, EXIT), (0x30, 0x28)];
        assert_eq!(classify(walked, 0, 128, &boundary()), Capture::NoRecord);
    }

    #[test]
    fn zero_symbol_address_is_never_a_boundary() {
        let walked = [(0x10, 0), (0x20, 0)];
        assert_eq!(
            classify(walked, 0, 128, &ExitBoundary::none()),
            Capture::Frames(vec![0x10, 0x20])
        );
    }

    #[test]
    fn nothing_left_after_skipping_is_empty() {
        let walked = [(0x10, 0x8), (0x20, 0x18)];
        assert_eq!(classify(walked, 5, 128, &boundary()), Capture::Empty);
    }

    #[test]
    fn size_filter_short_circuits_the_walk() {
        let policy = Policy::default().with_size_filter(1024, usize::MAX);
        assert_eq!(capture(&policy, 512, &boundary()), Capture::Filtered);
        assert!(matches!(
            capture(&policy, 2048, &ExitBoundary::none()),
            Capture::Frames(_)
        ));
    }

    #[test]
    fn disabled_backtraces_are_filtered() {
        let policy = Policy::default().with_backtraces(false);
        assert_eq!(capture(&policy, 4096, &boundary()), Capture::Filtered);
    }
}
