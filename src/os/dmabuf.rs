//! Recognising dma-buf descriptors.
//!
//! A dma-buf can be reached through many descriptors (dup, binder transfer,
//! re-import) and mapped many times, but it is one buffer. Buffers are keyed
//! by inode and counted the first time they are seen only.

use std::{
    fs,
    mem::MaybeUninit,
    sync::{Mutex, MutexGuard},
};

use hashbrown::HashMap;

use crate::{
    alloc::pointers::Identity,
    util::hash::{seeded, FastMap},
};

/// A dma-buf claimed by one tracked identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuf {
    pub inode: u64,
    /// Buffer size as exported by the kernel, if it says.
    pub size: Option<usize>,
}

/// Descriptor introspection. Implementations are called from inside the
/// tracker (suppressed), so they may allocate.
pub trait DescriptorProbe: Send + Sync {
    /// If `fd` refers to a dma-buf that no live identity has claimed yet, claim
    /// it for `owner` and describe it.
    fn claim(&self, fd: i32, owner: Identity) -> Option<DmaBuf>;

    /// Give back whatever `owner` claimed. A miss is a no-op.
    fn release(&self, owner: Identity);
}

/// What `/proc/self/fdinfo/<fd>` says about a descriptor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FdInfo {
    /// Exporter name; only dma-bufs have one.
    pub exp_name: Option<String>,
    pub inode: Option<u64>,
    pub size: Option<usize>,
}

impl FdInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "exp_name" => info.exp_name = Some(value.to_owned()),
                "ino" => info.inode = value.parse().ok(),
                "size" => info.size = value.parse().ok(),
                _ => {}
            }
        }
        info
    }

    pub fn is_dma_buf(&self) -> bool {
        self.exp_name.is_some()
    }
}

/// Which identity accounts for which dma-buf inode. Only the first identity
/// to claim an inode holds it; later claims are refused until it is released.
pub struct InodeClaims {
    by_owner: FastMap<Identity, u64>,
    by_inode: FastMap<u64, Identity>,
}

impl Default for InodeClaims {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeClaims {
    /// Does not allocate.
    pub const fn new() -> Self {
        Self {
            by_owner: HashMap::with_hasher(seeded()),
            by_inode: HashMap::with_hasher(seeded()),
        }
    }

    /// Claim `inode` for `owner`. Returns `false` if someone else holds it.
    pub fn claim(&mut self, inode: u64, owner: Identity) -> bool {
        if self.by_inode.contains_key(&inode) {
            return false;
        }
        if let Some(previous) = self.by_owner.insert(owner, inode) {
            // The identity was reused without a release
            self.by_inode.remove(&previous);
        }
        self.by_inode.insert(inode, owner);
        true
    }

    pub fn release(&mut self, owner: Identity) {
        if let Some(inode) = self.by_owner.remove(&owner) {
            self.by_inode.remove(&inode);
        }
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

/// [`DescriptorProbe`] backed by procfs.
pub struct ProcFdInfo {
    claims: Mutex<InodeClaims>,
}

impl Default for ProcFdInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFdInfo {
    /// Does not allocate.
    pub const fn new() -> Self {
        Self {
            claims: Mutex::new(InodeClaims::new()),
        }
    }

    fn lock_claims(&self) -> MutexGuard<'_, InodeClaims> {
        match self.claims.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn read_fdinfo(fd: i32) -> Option<FdInfo> {
        let text = fs::read_to_string(format!("/proc/self/fdinfo/{fd}")).ok()?;
        Some(FdInfo::parse(&text))
    }

    fn fstat_inode(fd: i32) -> Option<u64> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: `fstat()` fills `stat` on success and we only read it then
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return None;
        }
        Some(unsafe { stat.assume_init() }.st_ino as u64)
    }
}

impl DescriptorProbe for ProcFdInfo {
    fn claim(&self, fd: i32, owner: Identity) -> Option<DmaBuf> {
        if fd < 0 {
            return None;
        }
        let info = Self::read_fdinfo(fd)?;
        if !info.is_dma_buf() {
            return None;
        }
        let inode = info.inode.or_else(|| Self::fstat_inode(fd))?;
        self.lock_claims().claim(inode, owner).then_some(DmaBuf {
            inode,
            size: info.size,
        })
    }

    fn release(&self, owner: Identity) {
        self.lock_claims().release(owner);
    }
}
