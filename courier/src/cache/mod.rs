//! Cache layer: in-memory store and HTTP caching policy.
//!
//! The [`CacheStore`](store::CacheStore) holds fingerprint-keyed entries
//! and enforces read-time invalidation; the
//! [`HttpCachePolicy`](policy::HttpCachePolicy) decides what is cacheable,
//! for how long, and which conditional headers a refetch should carry.

pub mod policy;
pub mod store;

pub use policy::HttpCachePolicy;
pub use store::{CacheLookup, CacheStats, CacheStore};
