//! The live-allocation table and the byte counters derived from it.

use std::{
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use hashbrown::HashMap;
use serde::Serialize;

use crate::{
    alloc::frames::{BacktraceRef, FrameTable},
    report::{self, ReportEntry},
    util::hash::{seeded, FastMap},
};

/// Key of a tracked allocation. Addresses and descriptor numbers live in
/// separate namespaces: `Address(7)` and `Descriptor(7)` never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Identity {
    Address(usize),
    Descriptor(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Host,
    Mmap,
    Dma,
}

impl Category {
    pub fn name(self) -> &'static str {
        match self {
            Category::Host => "host",
            Category::Mmap => "mmap",
            Category::Dma => "dma",
        }
    }

    /// Host and anonymous maps share the host bucket.
    pub fn is_dma(self) -> bool {
        self == Category::Dma
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub identity: Identity,
    pub size: usize,
    pub category: Category,
    pub backtrace: BacktraceRef,
    pub time: SystemTime,
}

/// Current and peak bytes per bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub host: usize,
    pub dma: usize,
    pub total: usize,
    pub peak_host: usize,
    pub peak_dma: usize,
    pub peak_total: usize,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            host: 0,
            dma: 0,
            total: 0,
            peak_host: 0,
            peak_dma: 0,
            peak_total: 0,
        }
    }

    fn add(&mut self, category: Category, size: usize) {
        if category.is_dma() {
            self.dma += size;
            self.peak_dma = self.peak_dma.max(self.dma);
        } else {
            self.host += size;
            self.peak_host = self.peak_host.max(self.host);
        }
        self.total += size;
    }

    fn sub(&mut self, category: Category, size: usize) {
        if category.is_dma() {
            self.dma -= size;
        } else {
            self.host -= size;
        }
        self.total -= size;
    }
}

/// When to take a [`PeakSnapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeakPolicy {
    pub enabled: bool,
    /// Totals at or below this never produce a snapshot.
    pub threshold: usize,
}

/// The deduplicated allocation list as it stood at the highest total seen so
/// far (above the threshold).
#[derive(Debug, Clone, Default)]
pub struct PeakSnapshot {
    /// How many times the snapshot has been replaced.
    pub generation: u64,
    pub total: usize,
    pub entries: Vec<ReportEntry>,
}

#[derive(Debug)]
struct Inner {
    records: FastMap<Identity, AllocationRecord>,
    counters: Counters,
    peak: PeakSnapshot,
}

#[derive(Debug)]
pub struct PointerTable {
    inner: Mutex<Inner>,
}

impl Default for PointerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerTable {
    /// Does not allocate.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::with_hasher(seeded()),
                counters: Counters::new(),
                peak: PeakSnapshot {
                    generation: 0,
                    total: 0,
                    entries: Vec::new(),
                },
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    /// Insert `record`, returning the stale record it displaced (if the
    /// identity was reused without a release). The caller owns the stale
    /// record's backtrace reference.
    ///
    /// `frames` is locked while the pointer table is (pointer -> frame) when
    /// a new peak needs a snapshot.
    pub fn record(
        &self,
        record: AllocationRecord,
        frames: &FrameTable,
        peak: PeakPolicy,
    ) -> Option<AllocationRecord> {
        let mut inner = self.lock_inner();
        let stale = inner.records.insert(record.identity, record);
        if let Some(stale) = &stale {
            inner.counters.sub(stale.category, stale.size);
        }
        inner.counters.add(record.category, record.size);

        let total = inner.counters.total;
        if total > inner.counters.peak_total {
            inner.counters.peak_total = total;
            if peak.enabled && total > peak.threshold {
                let entries = report::dedup(collect(&inner.records, frames, true));
                inner.peak.generation += 1;
                inner.peak.total = total;
                inner.peak.entries = entries;
            }
        }
        stale
    }

    /// Remove and return the record for `identity`. A miss is not an error.
    pub fn forget(&self, identity: Identity) -> Option<AllocationRecord> {
        let mut inner = self.lock_inner();
        let record = inner.records.remove(&identity)?;
        inner.counters.sub(record.category, record.size);
        Some(record)
    }

    pub fn get(&self, identity: Identity) -> Option<AllocationRecord> {
        self.lock_inner().records.get(&identity).copied()
    }

    pub fn counters(&self) -> Counters {
        self.lock_inner().counters
    }

    pub fn peak_snapshot(&self) -> PeakSnapshot {
        self.lock_inner().peak.clone()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One entry per live allocation, optionally only those with an interned
    /// backtrace.
    pub fn entries(&self, frames: &FrameTable, only_with_backtrace: bool) -> Vec<ReportEntry> {
        let inner = self.lock_inner();
        collect(&inner.records, frames, only_with_backtrace)
    }
}

fn collect(
    records: &FastMap<Identity, AllocationRecord>,
    frames: &FrameTable,
    only_with_backtrace: bool,
) -> Vec<ReportEntry> {
    frames.with_locked(|lookup| {
        records
            .values()
            .filter_map(|record| {
                let backtrace = record.backtrace.stack_id().and_then(|id| lookup.get(id));
                if only_with_backtrace && backtrace.is_none() {
                    return None;
                }
                Some(ReportEntry::new(record, backtrace))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use proptest::prelude::*;

    use super::*;

    const KB: usize = 1024;

    fn host(addr: usize, size: usize) -> AllocationRecord {
        AllocationRecord {
            identity: Identity::Address(addr),
            size,
            category: Category::Host,
            backtrace: BacktraceRef::Filtered,
            time: UNIX_EPOCH + Duration::from_secs(addr as u64),
        }
    }

    #[test]
    fn buckets_and_total_follow_records() {
        let table = PointerTable::new();
        let frames = FrameTable::new();
        let off = PeakPolicy::default();
        table.record(host(0x1000, 100), &frames, off);
        table.record(
            AllocationRecord {
                category: Category::Mmap,
                ..host(0x2000, 4096)
            },
            &frames,
            off,
        );
        table.record(
            AllocationRecord {
                identity: Identity::Descriptor(7),
                category: Category::Dma,
                ..host(0, 8192)
            },
            &frames,
            off,
        );
        let c = table.counters();
        assert_eq!((c.host, c.dma, c.total), (4196, 8192, 12388));

        assert!(table.forget(Identity::Descriptor(7)).is_some());
        let c = table.counters();
        assert_eq!((c.host, c.dma, c.total), (4196, 0, 4196));
        assert_eq!(c.peak_dma, 8192);
        assert_eq!(c.peak_total, 12388);
    }

    #[test]
    fn address_and_descriptor_never_alias() {
        let table = PointerTable::new();
        let frames = FrameTable::new();
        table.record(host(7, 10), &frames, PeakPolicy::default());
        assert!(table.forget(Identity::Descriptor(7)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reused_identity_displaces_stale_record() {
        let table = PointerTable::new();
        let frames = FrameTable::new();
        let id = frames.intern(&[1, 2]);
        let stale = AllocationRecord {
            backtrace: BacktraceRef::Interned(id),
            ..host(0x10, 300)
        };
        assert!(table.record(stale, &frames, PeakPolicy::default()).is_none());
        let displaced = table.record(host(0x10, 50), &frames, PeakPolicy::default());
        assert_eq!(displaced, Some(stale));
        assert_eq!(table.counters().total, 50);
    }

    #[test]
    fn forgetting_unknown_identity_is_a_noop() {
        let table = PointerTable::new();
        assert!(table.forget(Identity::Address(0xdead)).is_none());
        assert_eq!(table.counters(), Counters::default());
    }

    #[test]
    fn peak_snapshot_taken_once_above_threshold_and_kept() {
        let table = PointerTable::new();
        let frames = FrameTable::new();
        let peak = PeakPolicy {
            enabled: true,
            threshold: 1024 * KB,
        };
        let traced = |addr, size, stack: &[usize]| AllocationRecord {
            backtrace: BacktraceRef::Interned(frames.intern(stack)),
            ..host(addr, size)
        };

        table.record(traced(0x1000, 900 * KB, &[1]), &frames, peak);
        assert_eq!(table.peak_snapshot().generation, 0);

        table.record(traced(0x2000, 200 * KB, &[2]), &frames, peak);
        let snapshot = table.peak_snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.total, 1100 * KB);
        assert_eq!(snapshot.entries.len(), 2);

        table.forget(Identity::Address(0x2000));
        table.forget(Identity::Address(0x1000));
        let after = table.peak_snapshot();
        assert_eq!(after.generation, 1);
        assert_eq!(after.entries.len(), 2);

        // Climbing back to (but not past) the old peak takes no new snapshot
        table.record(traced(0x3000, 1100 * KB, &[3]), &frames, peak);
        assert_eq!(table.peak_snapshot().generation, 1);
    }

    #[test]
    fn peak_snapshot_lists_only_backtraced_entries() {
        let table = PointerTable::new();
        let frames = FrameTable::new();
        let peak = PeakPolicy {
            enabled: true,
            threshold: 0,
        };
        table.record(host(0x1, 64), &frames, peak);
        let id = frames.intern(&[9]);
        table.record(
            AllocationRecord {
                backtrace: BacktraceRef::Interned(id),
                ..host(0x2, 64)
            },
            &frames,
            peak,
        );
        let snapshot = table.peak_snapshot();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].identity, Identity::Address(0x2));
    }

    proptest! {
        #[test]
        fn record_then_forget_restores_current(
            base in prop::collection::vec(1usize..1 << 20, 0..16),
            size in 1usize..1 << 24,
            category in prop_oneof![Just(Category::Host), Just(Category::Mmap), Just(Category::Dma)],
        ) {
            let table = PointerTable::new();
            let frames = FrameTable::new();
            for (i, size) in base.iter().enumerate() {
                table.record(host(0x1000 + i * 16, *size), &frames, PeakPolicy::default());
            }
            let before = table.counters();
            let id = Identity::Address(0x10_0000);
            table.record(AllocationRecord { identity: id, category, ..host(0, size) }, &frames, PeakPolicy::default());
            table.forget(id);
            let after = table.counters();
            prop_assert_eq!((after.host, after.dma, after.total), (before.host, before.dma, before.total));
            prop_assert_eq!(after.peak_total, before.peak_total.max(before.total + size));
        }

        #[test]
        fn peaks_never_decrease(ops in prop::collection::vec((any::<bool>(), 0usize..8, 1usize..4096), 1..64)) {
            let table = PointerTable::new();
            let frames = FrameTable::new();
            let mut last = Counters::default();
            for (alloc, slot, size) in ops {
                if alloc {
                    table.record(host(slot, size), &frames, PeakPolicy::default());
                } else {
                    table.forget(Identity::Address(slot));
                }
                let now = table.counters();
                prop_assert!(now.peak_total >= last.peak_total);
                prop_assert!(now.peak_host >= last.peak_host);
                prop_assert!(now.peak_total >= now.total);
                prop_assert!(now.peak_host >= now.host);
                last = now;
            }
        }
    }
}
