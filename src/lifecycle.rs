//! Process-wide tracker state: where the one [`Context`] lives, and how it is
//! brought up and torn down.
//!
//! Hooks can run before `main`, during `dlsym()`, on any thread and after the
//! exit handlers. So the context is not lazily built on first use: it is
//! written once into reserved static storage by the load-time constructor, and
//! everything else only ever reads the state word in front of it.

use std::{
    cell::UnsafeCell,
    io,
    mem::{self, MaybeUninit},
    ptr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::SystemTime,
};

use libc::c_int;

use crate::{
    alloc::capture::ExitBoundary,
    config::Policy,
    error::InitError,
    intercept::Context,
    os::{LibcBackend, ProcFdInfo},
    raw_println,
    report::{report_path, BANNER},
    sync::SuppressScope,
    util::{
        hint::cold,
        num::mib,
        print::{errno, set_errno},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Nothing has happened yet
    Uninit,
    /// Someone won the right to initialize and is doing it
    Initializing,
    Active,
    ShuttingDown,
    Finalized,
    /// Initialization failed. Hooks pass straight through, forever.
    Disabled,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Uninit,
            1 => State::Initializing,
            2 => State::Active,
            3 => State::ShuttingDown,
            4 => State::Finalized,
            _ => State::Disabled,
        }
    }
}

/// Static storage for a value that is written exactly once, by whoever wins
/// [`Reserved::begin()`], and never dropped.
pub struct Reserved<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
    /// Set once `cell` holds a value, independently of `state`.
    written: AtomicBool,
}

// SAFETY: `cell` is written once, before `written` is published with Release,
// and only read after observing it with Acquire.
unsafe impl<T: Send + Sync> Sync for Reserved<T> {}

impl<T> Default for Reserved<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reserved<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(State::Uninit as u8),
            written: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the right to initialize. Exactly one caller ever gets `Ok`.
    pub fn begin(&self) -> Result<(), State> {
        self.transition(State::Uninit, State::Initializing)
    }

    /// Move from `from` to `to`, failing with the actual state otherwise.
    pub fn transition(&self, from: State, to: State) -> Result<(), State> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::from_u8)
    }

    /// Store the value. The state is left alone.
    ///
    /// # Safety
    /// Only the caller that won [`Reserved::begin()`] may call this, once.
    pub unsafe fn write(&self, value: T) -> &T {
        let slot = &mut *self.cell.get();
        let value = slot.write(value);
        self.written.store(true, Ordering::Release);
        value
    }

    /// The value, once written, whatever the state.
    pub fn get(&self) -> Option<&T> {
        if self.written.load(Ordering::Acquire) {
            // SAFETY: `written` is only set after `cell` is initialized, and
            // the value is never moved or dropped afterwards
            Some(unsafe { (*self.cell.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// The value, but only while it is [`State::Active`].
    pub fn active(&self) -> Option<&T> {
        if self.state() == State::Active {
            self.get()
        } else {
            None
        }
    }
}

pub type ProcessContext = Context<LibcBackend, ProcFdInfo>;

static CONTEXT: Reserved<ProcessContext> = Reserved::new();

/// Cleared by the load-time constructor. Until then the process is still
/// being set up by the loader, and map hooks pass straight through.
static PRE_INIT: AtomicBool = AtomicBool::new(true);

pub fn state() -> State {
    CONTEXT.state()
}

pub fn in_pre_init() -> bool {
    PRE_INIT.load(Ordering::Acquire)
}

pub fn end_pre_init() {
    PRE_INIT.store(false, Ordering::Release);
}

/// The process context, from activation on. It stays reachable after
/// shutdown: its closed gate already turns every call into a pass-through.
#[inline(always)]
pub fn context() -> Option<&'static ProcessContext> {
    match CONTEXT.state() {
        State::Active | State::ShuttingDown | State::Finalized => CONTEXT.get(),
        _ => None,
    }
}

fn init_logging() {
    let env = env_logger::Env::default().filter_or("ALLOC_HOOK_LOG", "warn");
    // Another copy of the logger may already be installed; keep it.
    _ = env_logger::Builder::from_env(env).try_init();
}

/// Bring the tracker up: read the policy, build the context, install the
/// dump signal handler and the exit hook. On failure the tracker is disabled
/// for the rest of the process.
pub fn initialize() -> Result<&'static ProcessContext, InitError> {
    CONTEXT.begin().map_err(InitError::AlreadyInitialized)?;
    let _scope = SuppressScope::force();
    init_logging();

    let policy = Policy::from_env();
    let backend = LibcBackend;
    let missing = backend.resolve();
    if !missing.is_empty() {
        log::warn!("real allocator is missing {missing:?}; falling back to the functions it has");
    }
    let signal = policy.dump_signal;
    let context = Context::new(policy, ExitBoundary::resolve(), backend, ProcFdInfo::new());
    // SAFETY: we won `begin()` above
    let context = unsafe { CONTEXT.write(context) };

    let installed = signal
        .map_or(Ok(()), install_dump_signal)
        .and_then(|()| register_exit_hook());
    if let Err(err) = installed {
        cold(|| {
            log::error!("allocation tracking disabled: {err}");
            _ = CONTEXT.transition(State::Initializing, State::Disabled);
        });
        return Err(err);
    }

    _ = CONTEXT.transition(State::Initializing, State::Active);
    log::info!(
        "allocation tracking active (backtraces: {}, peak threshold: {:.1}MB)",
        context.policy().capture_backtraces,
        mib(context.policy().peak_threshold)
    );
    Ok(context)
}

/// Quiesce every hook, write the exit report if asked to, print the peak
/// summary and close the gate for good. Idempotent.
pub fn finalize() {
    let Some(context) = CONTEXT.active() else {
        return;
    };
    if CONTEXT.transition(State::Active, State::ShuttingDown).is_err() {
        return;
    }
    let counters = {
        let _scope = SuppressScope::force();
        let exit_report = context
            .policy()
            .dump_on_exit
            .then(|| report_path(&context.policy().dump_prefix, "exit", SystemTime::now()));
        context.shutdown(exit_report.as_deref())
    };
    raw_println!(
        "\n{BANNER}\nhost peak used: {:.6}MB, dma peak used {:.6}MB, total peak used: {:.6}MB\n",
        mib(counters.peak_host),
        mib(counters.peak_dma),
        mib(counters.peak_total)
    );
    _ = CONTEXT.transition(State::ShuttingDown, State::Finalized);
}

/// Write a report for the running process to `path` (the `checkpoint()`
/// export). Does nothing unless the tracker is active.
pub fn checkpoint(path: &std::path::Path) -> bool {
    let Some(context) = CONTEXT.active() else {
        return false;
    };
    match context.dump(path) {
        Ok(written) => written,
        Err(err) => {
            log::error!("checkpoint failed: {err}");
            false
        }
    }
}

extern "C" fn on_dump_signal(_: c_int) {
    let Some(context) = CONTEXT.active() else {
        return;
    };
    let saved = errno();
    // Errors cannot be reported from here without risking the allocator; the
    // report is simply lost.
    _ = context.dump_tagged("time");
    set_errno(saved);
}

fn install_dump_signal(signal: c_int) -> Result<(), InitError> {
    // SAFETY: an all-zero `sigaction` is a valid empty action
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = on_dump_signal as extern "C" fn(c_int) as usize;
    action.sa_flags = libc::SA_RESTART | libc::SA_ONSTACK;
    // SAFETY: `action` is a valid, exclusively borrowed sigaction
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, ptr::null_mut())
    };
    if rc != 0 {
        return Err(InitError::Signal {
            signal,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

extern "C" fn at_exit() {
    finalize();
}

fn register_exit_hook() -> Result<(), InitError> {
    // SAFETY: `at_exit` is a plain `extern "C" fn()` that lives for the whole
    // process
    if unsafe { libc::atexit(at_exit) } != 0 {
        return Err(InitError::ExitHook);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_initializer_wins() {
        let slot = Reserved::<u32>::new();
        assert_eq!(slot.state(), State::Uninit);
        assert!(slot.get().is_none());
        assert_eq!(slot.begin(), Ok(()));
        assert_eq!(slot.begin(), Err(State::Initializing));
        unsafe { slot.write(42) };
        assert_eq!(slot.get(), Some(&42));
        assert!(slot.active().is_none());
        assert_eq!(slot.transition(State::Initializing, State::Active), Ok(()));
        assert_eq!(slot.active(), Some(&42));
    }

    #[test]
    fn value_outlives_shutdown() {
        let slot = Reserved::<String>::new();
        slot.begin().unwrap();
        unsafe { slot.write("tables".to_owned()) };
        slot.transition(State::Initializing, State::Active).unwrap();
        slot.transition(State::Active, State::ShuttingDown).unwrap();
        assert!(slot.active().is_none());
        assert_eq!(slot.transition(State::Active, State::ShuttingDown), Err(State::ShuttingDown));
        slot.transition(State::ShuttingDown, State::Finalized).unwrap();
        assert_eq!(slot.get().map(String::as_str), Some("tables"));
    }

    #[test]
    fn disabled_never_activates() {
        let slot = Reserved::<u8>::new();
        slot.begin().unwrap();
        slot.transition(State::Initializing, State::Disabled).unwrap();
        assert_eq!(slot.begin(), Err(State::Disabled));
        assert_eq!(slot.transition(State::Initializing, State::Active), Err(State::Disabled));
        assert!(slot.active().is_none());
    }
}
