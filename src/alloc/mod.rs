pub mod capture;
pub mod frames;
pub mod pointers;
pub mod tracker;

pub use tracker::Tracker;
