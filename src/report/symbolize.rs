//! Turning raw return addresses into report lines. Only ever runs while a
//! report is being written.

use std::{
    ffi::{c_void, CStr},
    fmt,
    mem::MaybeUninit,
};

use serde::Serialize;

/// The object a frame's address falls into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Path(String),
    /// Mapped, but not backed by a named file (JIT code, anonymous exec maps).
    Anonymous(#[serde(serialize_with = "crate::serialize::serde_hex::serialize")] usize),
    Unknown,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Path(path) => f.write_str(path),
            Module::Anonymous(base) => write!(f, "<anonymous:{base:x}>"),
            Module::Unknown => f.write_str("<unknown>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSymbol {
    #[serde(serialize_with = "crate::serialize::serde_hex::serialize")]
    pub pc: usize,
    /// `pc` relative to the start of its module.
    #[serde(serialize_with = "crate::serialize::serde_hex::serialize")]
    pub rel_pc: usize,
    pub module: Module,
    /// Demangled name of the enclosing function.
    pub function: Option<String>,
    /// Distance of `pc` from the start of `function`.
    pub offset: usize,
}

impl FrameSymbol {
    /// One `#<index> ...` frame line, without the newline.
    pub fn write_line<W: fmt::Write>(&self, index: usize, w: &mut W) -> fmt::Result {
        write!(w, "#{index} {:x} {}", self.rel_pc, self.module)?;
        if let Some(function) = &self.function {
            write!(w, " ({function}")?;
            if self.offset != 0 {
                write!(w, "+{}", self.offset)?;
            }
            w.write_char(')')?;
        }
        Ok(())
    }
}

struct DlInfo {
    module: Module,
    base: usize,
    sname: Option<String>,
    saddr: usize,
}

fn dladdr(pc: usize) -> Option<DlInfo> {
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: `dladdr()` only writes `info`, and a zero return leaves it unused
    if unsafe { libc::dladdr(pc as *const c_void, info.as_mut_ptr()) } == 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    let base = info.dli_fbase as usize;
    let string = |s: *const libc::c_char| {
        // SAFETY: non-null `Dl_info` strings are NUL-terminated and live as
        // long as the object stays loaded
        (!s.is_null())
            .then(|| unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
    };
    let module = match string(info.dli_fname) {
        Some(path) => Module::Path(path),
        None => Module::Anonymous(base),
    };
    Some(DlInfo {
        module,
        base,
        sname: string(info.dli_sname),
        saddr: info.dli_saddr as usize,
    })
}

/// Resolve `pc` to its module, module-relative address and function.
pub fn symbolize(pc: usize) -> FrameSymbol {
    let dl = dladdr(pc);

    let mut function = None;
    let mut start = 0;
    // Return addresses point one past the call; look up the call itself.
    backtrace::resolve(pc.saturating_sub(1) as *mut c_void, |symbol| {
        if function.is_none() {
            function = symbol.name().map(|name| name.to_string());
            start = symbol.addr().map_or(0, |addr| addr as usize);
        }
    });
    if function.is_none() {
        if let Some(dl) = &dl {
            function = dl.sname.clone();
            start = dl.saddr;
        }
    }

    let (module, rel_pc) = match dl {
        Some(dl) => (dl.module, pc.wrapping_sub(dl.base)),
        None => (Module::Unknown, pc),
    };
    FrameSymbol {
        pc,
        rel_pc,
        module,
        offset: if start != 0 && start <= pc { pc - start } else { 0 },
        function,
    }
}
