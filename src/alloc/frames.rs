//! Hash-consed, reference-counted storage for captured stacks.

use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::{
    report::symbolize::{self, FrameSymbol},
    util::hash::{seeded, FastMap},
};

pub type StackId = u64;

/// Ids below this are taken by the [`BacktraceRef`] sentinels.
pub const FIRST_STACK_ID: StackId = 2;

/// What an allocation record says about its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BacktraceRef {
    /// No capture was attempted (size filter, or backtraces off).
    Filtered,
    /// A capture was attempted and produced nothing.
    Empty,
    Interned(StackId),
}

impl BacktraceRef {
    pub fn stack_id(self) -> Option<StackId> {
        match self {
            BacktraceRef::Interned(id) => Some(id),
            _ => None,
        }
    }
}

/// One distinct stack. Symbols are resolved the first time a report asks for
/// them and cached from then on.
#[derive(Debug)]
pub struct Backtrace {
    id: StackId,
    frames: Arc<[usize]>,
    symbols: OnceCell<Box<[FrameSymbol]>>,
}

impl Backtrace {
    pub fn id(&self) -> StackId {
        self.id
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn symbols(&self) -> &[FrameSymbol] {
        self.symbols
            .get_or_init(|| self.frames.iter().map(|&pc| symbolize::symbolize(pc)).collect())
    }
}

#[derive(Debug)]
struct Entry {
    refs: usize,
    backtrace: Arc<Backtrace>,
}

#[derive(Debug)]
struct Inner {
    by_frames: FastMap<Arc<[usize]>, StackId>,
    by_id: FastMap<StackId, Entry>,
    next_id: StackId,
}

#[derive(Debug)]
pub struct FrameTable {
    inner: Mutex<Inner>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    /// Does not allocate.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_frames: HashMap::with_hasher(seeded()),
                by_id: HashMap::with_hasher(seeded()),
                next_id: FIRST_STACK_ID,
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    /// Intern `frames`, taking one reference on the result.
    pub fn intern(&self, frames: &[usize]) -> StackId {
        let mut inner = self.lock_inner();
        if let Some(&id) = inner.by_frames.get(frames) {
            if let Some(entry) = inner.by_id.get_mut(&id) {
                entry.refs += 1;
            }
            return id;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let frames: Arc<[usize]> = Arc::from(frames);
        let backtrace = Arc::new(Backtrace {
            id,
            frames: frames.clone(),
            symbols: OnceCell::new(),
        });
        inner.by_frames.insert(frames, id);
        inner.by_id.insert(id, Entry { refs: 1, backtrace });
        id
    }

    /// Drop one reference on `id`, erasing the stack when it was the last.
    pub fn release(&self, id: StackId) {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.by_id.get_mut(&id) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = inner.by_id.remove(&id) {
                inner.by_frames.remove(entry.backtrace.frames());
            }
        }
    }

    /// Release whatever `backtrace` holds; sentinels are ignored.
    pub fn release_ref(&self, backtrace: BacktraceRef) {
        if let Some(id) = backtrace.stack_id() {
            self.release(id);
        }
    }

    /// A shared handle to a live stack. The handle outlives erasure but does
    /// not keep the table entry alive.
    pub fn get(&self, id: StackId) -> Option<Arc<Backtrace>> {
        self.lock_inner()
            .by_id
            .get(&id)
            .map(|entry| entry.backtrace.clone())
    }

    pub fn refs(&self, id: StackId) -> Option<usize> {
        self.lock_inner().by_id.get(&id).map(|entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.lock_inner().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with the table locked, for callers that resolve many ids at
    /// once (snapshots).
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&FrameLookup<'_>) -> R) -> R {
        let inner = self.lock_inner();
        f(&FrameLookup { inner: &inner })
    }
}

/// Read access to a locked [`FrameTable`].
pub(crate) struct FrameLookup<'a> {
    inner: &'a Inner,
}

impl FrameLookup<'_> {
    pub fn get(&self, id: StackId) -> Option<Arc<Backtrace>> {
        self.inner.by_id.get(&id).map(|entry| entry.backtrace.clone())
    }
}
