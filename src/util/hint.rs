/// Run `f` on a path the optimiser should treat as unlikely (first-time symbol
/// resolution, bootstrap allocations, errno-setting failures).
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
