//! Allocation tracking for a whole process, by shadowing the libc heap, map
//! and device-control entry points.
//!
//! Built with the `preload` feature this crate is a shared object meant for
//! `LD_PRELOAD`: it records every live allocation with the call stack that
//! made it and writes grouped reports on demand, at a new peak, or at exit.
//! Without the feature it is an ordinary library around the same
//! [`Context`], which is how the tests drive it.

pub mod alloc;
pub mod config;
pub mod error;
pub mod intercept;
pub mod lifecycle;
pub mod os;
pub mod report;
pub mod serialize;
pub mod sync;
pub mod util;

#[cfg(feature = "preload")]
mod externc;

pub use alloc::{
    pointers::{Category, Counters, Identity},
    Tracker,
};
pub use config::{Policy, ReportFormat};
pub use error::{ConfigError, InitError, ReportError};
pub use intercept::Context;
pub use report::Report;
