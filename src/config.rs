//! Startup policy. Read once from the environment when the tracker is
//! initialized, immutable afterwards.

use std::path::PathBuf;

use crate::error::ConfigError;

pub const DEFAULT_BACKTRACE_FRAMES: usize = 128;
pub const DEFAULT_SKIP_FRAMES: usize = 2;
/// Size filter lower bound applied when peak recording is switched on without
/// an explicit `BACKTRACE_MIN_SIZE`.
pub const DEFAULT_PEAK_MIN_SIZE: usize = 1024;
/// Requests larger than this are refused with `ENOMEM` before they reach the
/// real primitive.
pub const DEFAULT_MAX_TRACKED_SIZE: usize = (1 << 31) - 1;

#[cfg(target_os = "android")]
const DEFAULT_DUMP_PREFIX: &str = "/data/local/tmp/trace/backtrace_heap";
#[cfg(not(target_os = "android"))]
const DEFAULT_DUMP_PREFIX: &str = "/tmp/backtrace_heap";

const MB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Policy {
    /// Record allocations at all. With this off every hook is a pass-through.
    pub track_allocations: bool,
    /// Walk the stack for recorded allocations.
    pub capture_backtraces: bool,
    pub backtrace_frames: usize,
    /// Leading frames (the hook itself) dropped from every capture.
    pub skip_frames: usize,
    /// Only allocations with a size in `[min_size, max_size]` get a backtrace.
    pub min_size: usize,
    pub max_size: usize,
    /// Capture a deduplicated snapshot whenever the total crosses its previous
    /// peak above `peak_threshold` bytes.
    pub record_peak: bool,
    pub peak_threshold: usize,
    pub dump_on_exit: bool,
    pub dump_prefix: PathBuf,
    /// `None` disables the on-demand dump signal.
    pub dump_signal: Option<i32>,
    pub report_format: ReportFormat,
    pub max_tracked_size: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            track_allocations: true,
            capture_backtraces: true,
            backtrace_frames: DEFAULT_BACKTRACE_FRAMES,
            skip_frames: DEFAULT_SKIP_FRAMES,
            min_size: 0,
            max_size: usize::MAX,
            record_peak: false,
            peak_threshold: 0,
            dump_on_exit: false,
            dump_prefix: PathBuf::from(DEFAULT_DUMP_PREFIX),
            dump_signal: Some(default_dump_signal()),
            report_format: ReportFormat::Text,
            max_tracked_size: DEFAULT_MAX_TRACKED_SIZE,
        }
    }
}

#[cfg(target_os = "android")]
fn default_dump_signal() -> i32 {
    // BIONIC_SIGNAL_BACKTRACE
    33
}

#[cfg(not(target_os = "android"))]
fn default_dump_signal() -> i32 {
    // glibc keeps the signals below SIGRTMIN for itself
    libc::SIGRTMIN() + 1
}

impl Policy {
    /// Build the policy from the process environment, logging (and otherwise
    /// ignoring) malformed values.
    pub fn from_env() -> Self {
        let (policy, errors) = Self::from_lookup(|key| std::env::var(key).ok());
        for err in errors {
            log::warn!("{err}; using the default");
        }
        policy
    }

    /// Build the policy from an arbitrary variable lookup. Returns the policy
    /// together with every value that failed to parse.
    pub fn from_lookup<F>(lookup: F) -> (Self, Vec<ConfigError>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Self::default();
        let mut errors = Vec::new();
        let mut number = |var: &'static str| -> Option<usize> {
            let value = lookup(var)?;
            parse_value(var, &value).map_err(|e| errors.push(e)).ok()
        };

        let min_size = number("BACKTRACE_MIN_SIZE");
        if let Some(max) = number("BACKTRACE_MAX_SIZE") {
            policy.max_size = max;
        }
        if let Some(frames) = number("BACKTRACE_FRAMES") {
            policy.backtrace_frames = frames;
        }
        if let Some(skip) = number("BACKTRACE_SKIP_FRAMES") {
            policy.skip_frames = skip;
        }
        if let Some(max) = number("ALLOC_MAX_TRACKED_SIZE") {
            policy.max_tracked_size = max;
        }
        if let Some(peak_mb) = number("DUMP_PEAK_VALUE_MB") {
            policy.record_peak = true;
            policy.dump_on_exit = true;
            policy.peak_threshold = peak_mb.saturating_mul(MB);
        }
        policy.min_size = match min_size {
            Some(min) => min,
            None if policy.record_peak => DEFAULT_PEAK_MIN_SIZE,
            None => 0,
        };
        if let Some(signal) = number("BACKTRACE_DUMP_SIGNAL") {
            match i32::try_from(signal) {
                Ok(signal) if signal <= libc::SIGRTMAX() => {
                    policy.dump_signal = (signal != 0).then_some(signal);
                }
                _ => errors.push(ConfigError::OutOfRange {
                    var: "BACKTRACE_DUMP_SIGNAL",
                    value: signal,
                    max: libc::SIGRTMAX() as usize,
                }),
            }
        }

        let mut flag = |var: &'static str| -> Option<bool> {
            let value = lookup(var)?;
            parse_flag(var, &value).map_err(|e| errors.push(e)).ok()
        };
        if let Some(on) = flag("BACKTRACE") {
            policy.capture_backtraces = on;
        }
        if let Some(on) = flag("ALLOC_TRACK") {
            policy.track_allocations = on;
        }
        if let Some(on) = flag("BACKTRACE_DUMP_ON_EXIT") {
            policy.dump_on_exit = on;
        }

        if let Some(prefix) = lookup("BACKTRACE_DUMP_PREFIX").filter(|p| !p.is_empty()) {
            policy.dump_prefix = PathBuf::from(prefix);
        }
        if let Some(format) = lookup("BACKTRACE_DUMP_FORMAT") {
            match format.as_str() {
                "text" => policy.report_format = ReportFormat::Text,
                "json" => policy.report_format = ReportFormat::Json,
                _ => errors.push(ConfigError::UnknownValue {
                    var: "BACKTRACE_DUMP_FORMAT",
                    value: format,
                    expected: "text, json",
                }),
            }
        }

        (policy, errors)
    }

    /// Should an allocation of `size` bytes get a backtrace?
    pub fn wants_backtrace(&self, size: usize) -> bool {
        self.capture_backtraces && size >= self.min_size && size <= self.max_size
    }

    #[must_use]
    pub fn with_size_filter(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_peak_threshold_mb(mut self, mb: usize) -> Self {
        self.record_peak = true;
        self.peak_threshold = mb.saturating_mul(MB);
        self
    }

    #[must_use]
    pub fn with_backtraces(mut self, enabled: bool) -> Self {
        self.capture_backtraces = enabled;
        self
    }

    #[must_use]
    pub fn with_max_tracked_size(mut self, max: usize) -> Self {
        self.max_tracked_size = max;
        self
    }

    #[must_use]
    pub fn with_dump_signal(mut self, signal: Option<i32>) -> Self {
        self.dump_signal = signal;
        self
    }
}

fn parse_value(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let err = || ConfigError::NotAnInteger {
        var,
        value: value.to_owned(),
    };
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    value.parse().map_err(|_| err())
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::UnknownValue {
            var,
            value: value.to_owned(),
            expected: "0, 1, true, false, on, off",
        }),
    }
}
