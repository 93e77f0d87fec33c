//! Storefront records and the queries the storefront runs against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{Direction, Filter, FilterOp, Query};
use crate::service::Record;

// ============================================================================
// Products
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub price: f64,
  #[serde(default)]
  pub category: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_url: Option<String>,
  #[serde(default)]
  pub featured: bool,
  #[serde(default)]
  pub stock: u32,
}

impl Record for Product {
  const COLLECTION: &'static str = "products";
}

impl Product {
  pub fn new(name: impl Into<String>, price: f64) -> Self {
    Self {
      id: String::new(),
      name: name.into(),
      description: String::new(),
      price,
      category: String::new(),
      image_url: None,
      featured: false,
      stock: 0,
    }
  }

  /// Products in a category, alphabetically.
  pub fn by_category(category: &str) -> Query {
    Query::new()
      .filter(Filter::equals("category", category))
      .order_by("name", Direction::Asc)
  }

  /// Featured products for the landing page.
  pub fn featured(limit: usize) -> Query {
    Query::new()
      .filter(Filter::equals("featured", true))
      .order_by("name", Direction::Asc)
      .limit(limit)
  }

  /// Products priced within `[min, max]`, cheapest first.
  pub fn price_between(min: f64, max: f64) -> Query {
    Query::new()
      .filter(Filter::new("price", FilterOp::Ge, min))
      .filter(Filter::new("price", FilterOp::Le, max))
      .order_by("price", Direction::Asc)
  }

  pub fn in_stock(&self) -> bool {
    self.stock > 0
  }
}

// ============================================================================
// FAQs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faq {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  pub question: String,
  pub answer: String,
  /// Display position, ascending
  #[serde(default)]
  pub order: i64,
  #[serde(default = "default_published")]
  pub published: bool,
}

fn default_published() -> bool {
  true
}

impl Record for Faq {
  const COLLECTION: &'static str = "faqs";
}

impl Faq {
  /// Published FAQs in display order.
  pub fn ordered() -> Query {
    Query::new()
      .filter(Filter::equals("published", true))
      .order_by("order", Direction::Asc)
  }
}

// ============================================================================
// Contact messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  pub name: String,
  pub email: String,
  pub message: String,
  pub created_at: DateTime<Utc>,
}

impl Record for Contact {
  const COLLECTION: &'static str = "contacts";
}

impl Contact {
  pub fn new(name: impl Into<String>, email: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      id: String::new(),
      name: name.into(),
      email: email.into(),
      message: message.into(),
      created_at: Utc::now(),
    }
  }

  /// Most recent contact messages first.
  pub fn newest_first(limit: usize) -> Query {
    Query::new()
      .order_by("created_at", Direction::Desc)
      .limit(limit)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{CallKind, MemoryBackend};
  use crate::cache::CacheSource;
  use crate::config::Config;
  use crate::context::{ResilienceContext, WriteOutcome};
  use crate::queue::MemoryKvStore;
  use crate::service::DataAccessService;
  use serde_json::json;
  use std::sync::Arc;

  fn context() -> (Arc<ResilienceContext>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert(
      "products",
      "p1",
      json!({"name": "Lamp", "price": 40.0, "category": "lighting", "featured": true, "stock": 3}),
    );
    backend.insert(
      "products",
      "p2",
      json!({"name": "Desk", "price": 250.0, "category": "furniture", "stock": 0}),
    );
    backend.insert(
      "products",
      "p3",
      json!({"name": "Bulb", "price": 5.0, "category": "lighting", "featured": true}),
    );
    let mut config = Config::default();
    config.rate_limit.max_tokens = 100.0;
    config.retry.jitter = false;
    let ctx = ResilienceContext::new(&config, backend.clone(), Arc::new(MemoryKvStore::new())).unwrap();
    (ctx, backend)
  }

  #[tokio::test(start_paused = true)]
  async fn test_products_by_category() {
    let (ctx, backend) = context();
    let products = DataAccessService::<Product>::new(ctx);

    let lighting = products.list(&Product::by_category("lighting")).await.unwrap();
    let names: Vec<&str> = lighting.data.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Bulb", "Lamp"]);
    assert_eq!(lighting.data[1].id, "p1");
    assert!(lighting.data[1].in_stock());

    let again = products.list(&Product::by_category("lighting")).await.unwrap();
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(backend.calls(CallKind::FetchMany), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_featured_and_price_range() {
    let (ctx, _backend) = context();
    let products = DataAccessService::<Product>::new(ctx);

    let featured = products.list(&Product::featured(1)).await.unwrap();
    assert_eq!(featured.data.len(), 1);
    assert_eq!(featured.data[0].name, "Bulb");

    let cheap = products.list(&Product::price_between(1.0, 50.0)).await.unwrap();
    let prices: Vec<f64> = cheap.data.iter().map(|p| p.price).collect();
    assert_eq!(prices, vec![5.0, 40.0]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_missing_product_is_none() {
    let (ctx, _backend) = context();
    let products = DataAccessService::<Product>::new(ctx);
    assert!(products.get("nope").await.unwrap().data.is_none());
    assert_eq!(products.get("p2").await.unwrap().data.unwrap().name, "Desk");
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_invalidates_lists_and_item() {
    let (ctx, backend) = context();
    let products = DataAccessService::<Product>::new(ctx);

    products.list(&Product::by_category("lighting")).await.unwrap();
    products.get("p1").await.unwrap();

    let outcome = products.update("p1", json!({"price": 45.0})).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Applied { id: "p1".into() });

    let item = products.get("p1").await.unwrap();
    assert_eq!(item.source, CacheSource::Network);
    assert_eq!(item.data.unwrap().price, 45.0);
    let list = products.list(&Product::by_category("lighting")).await.unwrap();
    assert_eq!(list.source, CacheSource::Network);
    assert_eq!(backend.calls(CallKind::FetchMany), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_contact_created_offline_is_queued_without_id() {
    let (ctx, backend) = context();
    let contacts = DataAccessService::<Contact>::new(Arc::clone(&ctx));
    ctx.set_online(false);

    let outcome = contacts
      .create(&Contact::new("Ada", "ada@example.com", "Do you ship abroad?"))
      .await
      .unwrap();
    assert!(outcome.is_queued());

    let pending = ctx.queue().list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation.collection, "contacts");
    assert!(pending[0].operation.payload.get("id").is_none());
    assert_eq!(backend.total_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_faqs_and_contacts_ordering() {
    let (ctx, backend) = context();
    backend.insert("faqs", "f1", json!({"question": "Returns?", "answer": "30 days", "order": 2, "published": true}));
    backend.insert("faqs", "f2", json!({"question": "Shipping?", "answer": "3 days", "order": 1, "published": true}));
    backend.insert(
      "faqs",
      "f3",
      json!({"question": "Draft", "answer": "-", "order": 0, "published": false}),
    );
    backend.insert(
      "contacts",
      "c1",
      json!({"name": "A", "email": "a@x.io", "message": "hi", "created_at": "2026-01-01T10:00:00Z"}),
    );
    backend.insert(
      "contacts",
      "c2",
      json!({"name": "B", "email": "b@x.io", "message": "yo", "created_at": "2026-03-01T10:00:00Z"}),
    );

    let faqs = DataAccessService::<Faq>::new(Arc::clone(&ctx));
    let questions: Vec<String> = faqs
      .list(&Faq::ordered())
      .await
      .unwrap()
      .data
      .into_iter()
      .map(|f| f.question)
      .collect();
    assert_eq!(questions, vec!["Shipping?", "Returns?"]);

    let contacts = DataAccessService::<Contact>::new(ctx);
    let newest = contacts.list(&Contact::newest_first(1)).await.unwrap();
    assert_eq!(newest.data[0].id, "c2");
  }
}
