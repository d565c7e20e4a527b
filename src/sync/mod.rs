pub mod gate;
pub mod reentrancy;

pub use gate::{Gate, ReadGuard, WriteGuard};
pub use reentrancy::SuppressScope;
