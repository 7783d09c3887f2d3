//! Utility modules shared by the network and decoder layers.

pub mod mapping;
pub mod throttle;

pub use mapping::MemoryRegion;
pub use throttle::LogThrottler;
