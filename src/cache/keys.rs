//! Cache key layout and write invalidation.

use serde::{Deserialize, Serialize};

use crate::backend::Query;

/// Key for a single document: `"{collection}:{id}"`.
pub fn item_key(collection: &str, id: &str) -> String {
  format!("{}:{}", collection, id)
}

/// Key for a query result: `"{collection}?{signature}"`.
pub fn query_key(collection: &str, query: &Query) -> String {
  format!("{}{}", query_prefix(collection), query.signature())
}

/// Prefix shared by every query result of a collection.
pub fn query_prefix(collection: &str) -> String {
  format!("{}?", collection)
}

/// Cache entries a write makes stale.
///
/// Persisted with queued writes so a replay after restart invalidates the
/// same entries the original call would have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
  /// Exact keys to drop
  #[serde(default)]
  pub keys: Vec<String>,
  /// Key prefixes to drop (list and query results)
  #[serde(default)]
  pub prefixes: Vec<String>,
}

impl Invalidation {
  pub fn none() -> Self {
    Self::default()
  }

  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.keys.push(key.into());
    self
  }

  pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefixes.push(prefix.into());
    self
  }

  /// The default invalidation for a write to `collection`: the document's
  /// own key (when known) and every cached query over the collection.
  pub fn for_write(collection: &str, id: Option<&str>) -> Self {
    let mut invalidation = Self::none().prefix(query_prefix(collection));
    if let Some(id) = id {
      invalidation = invalidation.key(item_key(collection, id));
    }
    invalidation
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty() && self.prefixes.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::Filter;

  #[test]
  fn test_key_layout() {
    assert_eq!(item_key("products", "p1"), "products:p1");
    let key = query_key("products", &Query::new());
    assert!(key.starts_with("products?"));
    assert_eq!(key.len(), "products?".len() + 64);
  }

  #[test]
  fn test_equal_queries_share_a_key() {
    let a = Query::new().filter(Filter::equals("category", "shoes")).limit(10);
    let b = Query::new().filter(Filter::equals("category", "shoes")).limit(10);
    let c = Query::new().filter(Filter::equals("category", "hats")).limit(10);
    assert_eq!(query_key("products", &a), query_key("products", &b));
    assert_ne!(query_key("products", &a), query_key("products", &c));
  }

  #[test]
  fn test_for_write() {
    let inv = Invalidation::for_write("products", Some("p1"));
    assert_eq!(inv.keys, vec!["products:p1".to_string()]);
    assert_eq!(inv.prefixes, vec!["products?".to_string()]);

    let inv = Invalidation::for_write("faqs", None);
    assert!(inv.keys.is_empty());
    assert!(!inv.is_empty());
  }
}
