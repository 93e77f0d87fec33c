//! Result metadata for cached reads.

/// Result from a read, including data and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new result from cached data.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Create a new result from a network call started by another reader.
  pub fn shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Shared,
    }
  }

  /// Convert the payload while keeping the source.
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the in-memory cache, no network involved
  Cache,
  /// Fresh data from this caller's own backend call
  Network,
  /// Joined a backend call already in flight for the same key
  Shared,
}
