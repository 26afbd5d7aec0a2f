//! In-memory caches
//!
//! A TTL cache used by the environment store and a single-flight cache used
//! for loaded application manifests, where concurrent misses on the same key
//! must run the loader only once.

pub mod singleflight;
pub mod ttl;

pub use singleflight::SingleflightCache;
pub use ttl::TtlCache;
