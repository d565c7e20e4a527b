use ahash::RandomState;
use hashbrown::HashMap;

/// The map every tracker table uses.
pub type FastMap<K, V> = HashMap<K, V, RandomState>;

/// A hasher with fixed seeds. `RandomState::new()` may allocate to seed itself,
/// which is not allowed while the tracker is being constructed.
pub const fn seeded() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}
