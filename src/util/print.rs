use std::fmt::{self, Write};

#[cfg(target_os = "android")]
use libc::__errno as errno_location;
#[cfg(not(target_os = "android"))]
use libc::__errno_location as errno_location;

/// Write every byte of `bytes` to `fd` with raw `write(2)` calls. Never touches
/// the allocator, so it is usable from inside the hooks and after finalize.
pub fn write_fd(fd: libc::c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, `write()` only reads from it.
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
        if n <= 0 {
            if n < 0 && errno() == libc::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

pub fn errno() -> libc::c_int {
    // SAFETY: the errno accessor always returns a valid thread-local pointer
    unsafe { *errno_location() }
}

pub fn set_errno(value: libc::c_int) {
    // SAFETY: see `errno()`
    unsafe { *errno_location() = value }
}

/// A fixed-capacity text buffer living on the stack. Output past the capacity
/// is silently truncated rather than reallocated.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn flush_to(&self, fd: libc::c_int) {
        write_fd(fd, self.as_bytes());
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// `println!()` into a [`StackBuf`] and out to stdout, without allocating.
#[macro_export]
macro_rules! raw_println {
    ($($arg:tt)*) => {{
        use ::std::fmt::Write as _;
        let mut buf = $crate::util::print::StackBuf::<512>::new();
        _ = writeln!(buf, $($arg)*);
        buf.flush_to(::libc::STDOUT_FILENO);
    }};
}
