//! In-memory response cache for backend reads.
//!
//! This module provides:
//! - A bounded, TTL-expiring LRU cache keyed by opaque strings
//! - Key builders for single documents and query results
//! - Invalidation descriptors recorded alongside writes

mod keys;
mod traits;
mod ttl;

pub use keys::{item_key, query_key, query_prefix, Invalidation};
pub use traits::{CacheResult, CacheSource};
pub use ttl::Cache;
