use std::{io, path::PathBuf};

use thiserror::Error;

/// A malformed configuration value. The caller logs it and keeps the default.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative base-10 integer, got {value:?}")]
    NotAnInteger { var: &'static str, value: String },
    #[error("{var}: expected one of {expected}, got {value:?}")]
    UnknownValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{var}: {value} is above the largest allowed value {max}")]
    OutOfRange {
        var: &'static str,
        value: usize,
        max: usize,
    },
}

/// Failure while bringing the tracker up. Any of these leaves tracking
/// permanently disabled; the real primitives keep working.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("tracker was already initialized (state {0:?})")]
    AlreadyInitialized(crate::lifecycle::State),
    #[error("could not install handler for signal {signal}: {source}")]
    Signal { signal: i32, source: io::Error },
    #[error("could not register the exit hook")]
    ExitHook,
}

/// Failure while writing one report. Only that report is lost.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not create report file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("i/o error while writing report: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode report as json: {0}")]
    Json(#[from] serde_json::Error),
}
