//! Distributed coordination primitives built on the shared registry.
//!
//! Currently a single primitive: [`DistributedLock`], used to serialize
//! instance-index acquisition across racing workers.

mod lock;

pub use lock::DistributedLock;
pub use lock::LockConfig;
pub use lock::LockGuard;
