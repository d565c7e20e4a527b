//! Reports: what is live (or was live at the peak), grouped by call site.

pub mod symbolize;

use std::{
    cmp::Reverse,
    fs::OpenOptions,
    io::{self, BufWriter, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    alloc::{
        frames::{Backtrace, BacktraceRef},
        pointers::{AllocationRecord, Category, Counters, Identity},
    },
    config::ReportFormat,
    error::ReportError,
    report::symbolize::FrameSymbol,
    util::num::{kib, mib},
};

pub const BANNER: &str =
    "+++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++";

/// One line of a report: a live allocation, or a group of identical ones.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub identity: Identity,
    pub size: usize,
    pub category: Category,
    /// How many allocations this entry stands for.
    pub count: usize,
    pub time: SystemTime,
    pub stack: BacktraceRef,
    pub backtrace: Option<Arc<Backtrace>>,
}

impl ReportEntry {
    pub fn new(record: &AllocationRecord, backtrace: Option<Arc<Backtrace>>) -> Self {
        Self {
            identity: record.identity,
            size: record.size,
            category: record.category,
            count: 1,
            time: record.time,
            stack: record.backtrace,
            backtrace,
        }
    }

    fn frame_count(&self) -> usize {
        self.backtrace.as_ref().map_or(0, |bt| bt.frames().len())
    }

    pub fn bytes(&self) -> usize {
        self.size * self.count
    }
}

/// Group identical allocations: same size, same stack. The order is size
/// descending, then entries with a backtrace first, then deeper stacks first.
/// Applying this twice changes nothing.
pub fn dedup(mut entries: Vec<ReportEntry>) -> Vec<ReportEntry> {
    entries.sort_by_key(|e| {
        (
            Reverse(e.size),
            e.backtrace.is_none(),
            Reverse(e.frame_count()),
            e.stack,
            e.identity,
        )
    });
    let mut merged: Vec<ReportEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match merged.last_mut() {
            Some(last) if last.size == entry.size && last.stack == entry.stack => {
                last.count += entry.count;
            }
            _ => merged.push(entry),
        }
    }
    merged
}

/// Host/DMA split of a set of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub host: usize,
    pub dma: usize,
}

impl Usage {
    pub fn of(entries: &[ReportEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut usage, e| {
            if e.category.is_dma() {
                usage.dma += e.bytes();
            } else {
                usage.host += e.bytes();
            }
            usage
        })
    }

    pub fn total(&self) -> usize {
        self.host + self.dma
    }
}

/// Everything one report file says, collected under the tracker's locks and
/// written without them.
#[derive(Debug, Clone)]
pub struct Report {
    pub counters: Counters,
    /// Entries are the peak snapshot rather than what is live now.
    pub peak_mode: bool,
    pub entries: Vec<ReportEntry>,
}

fn format_time(time: SystemTime) -> (String, u32) {
    let local: DateTime<Local> = time.into();
    (
        local.format("%Y-%m-%d %H:%M:%S").to_string(),
        local.timestamp_subsec_millis(),
    )
}

impl Report {
    pub fn listed(&self) -> Usage {
        Usage::of(&self.entries)
    }

    pub fn write_text<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let c = &self.counters;
        writeln!(
            w,
            "host peak used: {:.6}MB, dma peak used {:.6}MB, total peak used: {:.6}MB",
            mib(c.peak_host),
            mib(c.peak_dma),
            mib(c.peak_total)
        )?;
        writeln!(w, "{BANNER}\n")?;
        let listed = self.listed();
        let label = if self.peak_mode { "peak" } else { "current" };
        writeln!(
            w,
            "{label} host used: {:.6}MB, {label} dma used {:.6}MB, {label} total used: {:.6}MB",
            mib(listed.host),
            mib(listed.dma),
            mib(listed.total())
        )?;
        writeln!(w, "{BANNER}\n")?;

        let mut line = String::new();
        for entry in &self.entries {
            let (time, millis) = format_time(entry.time);
            writeln!(
                w,
                "alloc_size:{:.6}KB \t alloc_type:{} \t alloc_num:{} \t alloc_time:{time}.{millis}",
                kib(entry.size),
                entry.category.name(),
                entry.count
            )?;
            if let Some(backtrace) = &entry.backtrace {
                for (i, symbol) in backtrace.symbols().iter().enumerate() {
                    line.clear();
                    // Writing into a String cannot fail
                    _ = symbol.write_line(i, &mut line);
                    writeln!(w, "{line}")?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn write_json<W: Write>(&self, w: &mut W) -> Result<(), ReportError> {
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let (time, millis) = format_time(entry.time);
                JsonEntry {
                    identity: entry.identity,
                    size: entry.size,
                    category: entry.category,
                    count: entry.count,
                    time: format!("{time}.{millis:03}"),
                    frames: entry.backtrace.as_ref().map(|bt| bt.symbols()).unwrap_or(&[]),
                }
            })
            .collect();
        let doc = JsonReport {
            peak: Usage {
                host: self.counters.peak_host,
                dma: self.counters.peak_dma,
            },
            peak_mode: self.peak_mode,
            listed: self.listed(),
            entries,
        };
        serde_json::to_writer_pretty(&mut *w, &doc)?;
        writeln!(w)?;
        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W, format: ReportFormat) -> Result<(), ReportError> {
        match format {
            ReportFormat::Text => self.write_text(w)?,
            ReportFormat::Json => self.write_json(w)?,
        }
        Ok(())
    }

    /// Write the report to `path`, replacing any existing file. Symlinks at
    /// `path` are refused.
    pub fn save(&self, path: &Path, format: ReportFormat) -> Result<(), ReportError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| ReportError::Create {
                path: path.to_owned(),
                source,
            })?;
        let mut w = BufWriter::new(file);
        self.write(&mut w, format)?;
        w.flush()?;
        log::info!(
            "wrote {} report entries to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }
}

/// `<prefix>.<kind>.<unix seconds>.txt`
pub fn report_path(prefix: &Path, kind: &str, time: SystemTime) -> PathBuf {
    let secs = time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    let mut path = prefix.as_os_str().to_owned();
    path.push(format!(".{kind}.{secs}.txt"));
    PathBuf::from(path)
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    identity: Identity,
    size: usize,
    category: Category,
    count: usize,
    time: String,
    frames: &'a [FrameSymbol],
}

#[derive(Serialize)]
struct JsonReport<'a> {
    peak: Usage,
    peak_mode: bool,
    listed: Usage,
    entries: Vec<JsonEntry<'a>>,
}
