//! Run cache: maps (pass identity, input artifact) to a previously produced
//! output artifact so unchanged pipeline prefixes are never recomputed.

pub mod fs;
pub mod key;
pub mod noop;
pub mod store;

pub use fs::FsRunCache;
pub use key::CacheKey;
pub use noop::NoopCache;
pub use store::{CacheEntry, CacheStats, RunCache};
