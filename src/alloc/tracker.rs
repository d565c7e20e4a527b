use std::time::SystemTime;

use crate::{
    alloc::{
        capture::{self, Capture, ExitBoundary},
        frames::{BacktraceRef, FrameTable},
        pointers::{AllocationRecord, Category, Counters, Identity, PeakPolicy, PointerTable},
    },
    config::Policy,
    report::{self, Report, ReportEntry},
};

/// The bookkeeping half of the interposer: stacks, live allocations and the
/// policy that decides what gets recorded. Knows nothing about which primitive
/// produced an allocation.
pub struct Tracker {
    policy: Policy,
    boundary: ExitBoundary,
    frames: FrameTable,
    pointers: PointerTable,
}

impl Tracker {
    /// Does not allocate.
    pub fn new(policy: Policy, boundary: ExitBoundary) -> Self {
        Self {
            policy,
            boundary,
            frames: FrameTable::new(),
            pointers: PointerTable::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn pointers(&self) -> &PointerTable {
        &self.pointers
    }

    pub fn counters(&self) -> Counters {
        self.pointers.counters()
    }

    fn peak_policy(&self) -> PeakPolicy {
        PeakPolicy {
            enabled: self.policy.record_peak,
            threshold: self.policy.peak_threshold,
        }
    }

    /// Capture the caller's stack (as the policy allows) and record a fresh
    /// allocation. Returns `false` if nothing was recorded.
    pub fn track(&self, identity: Identity, size: usize, category: Category) -> bool {
        if !self.policy.track_allocations {
            return false;
        }
        let backtrace = match capture::capture(&self.policy, size, &self.boundary) {
            Capture::NoRecord => return false,
            Capture::Filtered => BacktraceRef::Filtered,
            Capture::Empty => BacktraceRef::Empty,
            Capture::Frames(frames) => BacktraceRef::Interned(self.frames.intern(&frames)),
        };
        self.record(AllocationRecord {
            identity,
            size,
            category,
            backtrace,
            time: SystemTime::now(),
        });
        true
    }

    /// Record an allocation whose backtrace is already interned (or a
    /// sentinel). Takes over the record's backtrace reference.
    pub fn record(&self, record: AllocationRecord) {
        let stale = self
            .pointers
            .record(record, &self.frames, self.peak_policy());
        if let Some(stale) = stale {
            self.frames.release_ref(stale.backtrace);
        }
    }

    /// Stop tracking `identity`, returning what was recorded for it.
    pub fn forget(&self, identity: Identity) -> Option<AllocationRecord> {
        let record = self.detach(identity)?;
        self.release(record);
        Some(record)
    }

    /// Stop tracking `identity` but keep holding its backtrace reference, so
    /// the record can still be [`reattach`](Tracker::reattach)ed or
    /// [`release`](Tracker::release)d.
    pub fn detach(&self, identity: Identity) -> Option<AllocationRecord> {
        self.pointers.forget(identity)
    }

    /// Track a detached record again, as it was.
    pub fn reattach(&self, record: AllocationRecord) {
        self.record(record);
    }

    /// Drop the backtrace reference a detached record still holds.
    pub fn release(&self, record: AllocationRecord) {
        self.frames.release_ref(record.backtrace);
    }

    /// One entry per live allocation.
    pub fn snapshot(&self, only_with_backtrace: bool) -> Vec<ReportEntry> {
        self.pointers.entries(&self.frames, only_with_backtrace)
    }

    /// Collect a report: the peak snapshot when peak recording is on, otherwise
    /// every live allocation that has a backtrace, oldest first.
    pub fn report(&self) -> Report {
        let counters = self.counters();
        let entries = if self.policy.record_peak {
            self.pointers.peak_snapshot().entries
        } else {
            let mut live = self.snapshot(true);
            live.sort_by_key(|e| e.time);
            live
        };
        Report {
            counters,
            peak_mode: self.policy.record_peak,
            entries,
        }
    }

    /// The live allocations, grouped by call site.
    pub fn grouped(&self) -> Vec<ReportEntry> {
        report::dedup(self.snapshot(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(policy: Policy) -> Tracker {
        Tracker::new(policy, ExitBoundary::none())
    }

    #[test]
    fn size_filter_decides_capture() {
        let tracker = tracker(Policy::default().with_size_filter(1024, usize::MAX));
        assert!(tracker.track(Identity::Address(0x10), 512, Category::Host));
        let small = tracker.pointers().get(Identity::Address(0x10)).unwrap();
        assert_eq!(small.backtrace, BacktraceRef::Filtered);
        assert!(tracker.frames().is_empty());

        assert!(tracker.track(Identity::Address(0x20), 2048, Category::Host));
        let big = tracker.pointers().get(Identity::Address(0x20)).unwrap();
        assert!(matches!(big.backtrace, BacktraceRef::Interned(_)));
        assert_eq!(tracker.frames().len(), 1);
    }

    #[test]
    fn forget_releases_the_stack() {
        let tracker = tracker(Policy::default());
        let id = tracker.frames().intern(&[1, 2, 3]);
        tracker.record(AllocationRecord {
            identity: Identity::Address(0x10),
            size: 64,
            category: Category::Host,
            backtrace: BacktraceRef::Interned(id),
            time: SystemTime::now(),
        });
        assert!(tracker.forget(Identity::Address(0x10)).is_some());
        assert!(tracker.frames().is_empty());
        assert!(tracker.forget(Identity::Address(0x10)).is_none());
    }

    #[test]
    fn detached_record_keeps_its_stack_until_released() {
        let tracker = tracker(Policy::default());
        let id = tracker.frames().intern(&[7, 8]);
        let record = AllocationRecord {
            identity: Identity::Address(0x10),
            size: 64,
            category: Category::Host,
            backtrace: BacktraceRef::Interned(id),
            time: SystemTime::now(),
        };
        tracker.record(record);

        let detached = tracker.detach(Identity::Address(0x10)).unwrap();
        assert!(tracker.pointers().is_empty());
        assert_eq!(tracker.counters().host, 0);
        assert_eq!(tracker.frames().refs(id), Some(1));

        tracker.reattach(detached);
        assert_eq!(tracker.pointers().get(Identity::Address(0x10)), Some(record));
        assert_eq!(tracker.counters().host, 64);

        let detached = tracker.detach(Identity::Address(0x10)).unwrap();
        tracker.release(detached);
        assert!(tracker.frames().is_empty());
    }

    #[test]
    fn displaced_record_gives_back_its_stack() {
        let tracker = tracker(Policy::default());
        for stack in [[1usize, 2], [3, 4]] {
            let id = tracker.frames().intern(&stack);
            tracker.record(AllocationRecord {
                identity: Identity::Address(0x10),
                size: 64,
                category: Category::Host,
                backtrace: BacktraceRef::Interned(id),
                time: SystemTime::now(),
            });
        }
        assert_eq!(tracker.frames().len(), 1);
        assert_eq!(tracker.pointers().len(), 1);
    }

    #[test]
    fn identical_allocations_group_with_multiplicity() {
        let tracker = tracker(Policy::default());
        let id = tracker.frames().intern(&[0x100, 0x200]);
        for addr in [0x10, 0x20] {
            tracker.frames().intern(&[0x100, 0x200]);
            tracker.record(AllocationRecord {
                identity: Identity::Address(addr),
                size: 4096,
                category: Category::Host,
                backtrace: BacktraceRef::Interned(id),
                time: SystemTime::now(),
            });
        }
        tracker.frames().release(id);
        let grouped = tracker.grouped();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].count, 2);
    }

    #[test]
    fn tracking_off_records_nothing() {
        let mut policy = Policy::default();
        policy.track_allocations = false;
        let tracker = tracker(policy);
        assert!(!tracker.track(Identity::Address(0x10), 64, Category::Host));
        assert!(tracker.pointers().is_empty());
    }

    #[test]
    fn report_without_peak_lists_live_traced_allocations_oldest_first() {
        let tracker = tracker(Policy::default());
        let id = tracker.frames().intern(&[1]);
        let now = SystemTime::now();
        for (addr, age) in [(0x10, 1), (0x20, 5)] {
            tracker.frames().intern(&[1]);
            tracker.record(AllocationRecord {
                identity: Identity::Address(addr),
                size: 10,
                category: Category::Host,
                backtrace: BacktraceRef::Interned(id),
                time: now - std::time::Duration::from_secs(age),
            });
        }
        tracker.record(AllocationRecord {
            identity: Identity::Address(0x30),
            size: 10,
            category: Category::Host,
            backtrace: BacktraceRef::Filtered,
            time: now,
        });
        let report = tracker.report();
        assert!(!report.peak_mode);
        let order: Vec<_> = report.entries.iter().map(|e| e.identity).collect();
        assert_eq!(order, [Identity::Address(0x20), Identity::Address(0x10)]);
    }
}
