use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Backend, Document, Query};
use crate::config::{BackendConfig, Config};
use crate::error::{BackendError, ErrorCode};

#[derive(Debug, Deserialize)]
struct ApiCreated {
  id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
  #[serde(default)]
  message: String,
}

/// REST document API client.
///
/// Routes: `GET/POST /{collection}` and `GET/PATCH/DELETE /{collection}/{id}`.
/// Queries travel as `filter=field:op:json`, `order_by`, `direction` and
/// `limit` parameters.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpBackend {
  pub fn new(config: &BackendConfig) -> Result<Self> {
    let url = config
      .url
      .as_deref()
      .ok_or_else(|| eyre!("backend.url is not configured"))?;
    let base = Url::parse(url).map_err(|e| eyre!("Invalid backend url {}: {}", url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Backend url {} cannot carry a path", url));
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token: Config::api_token(),
    })
  }

  fn url(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    // cannot_be_a_base was rejected in new()
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, BackendError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
      .map(|b| b.message)
      .ok()
      .filter(|m| !m.is_empty())
      .unwrap_or(body);
    Err(BackendError::new(
      code_for_status(status),
      format!("HTTP {}: {}", status.as_u16(), message),
    ))
  }
}

/// Encode a query as URL parameters.
fn apply_query(url: &mut Url, query: &Query) {
  if *query == Query::default() {
    return;
  }
  let mut pairs = url.query_pairs_mut();
  for filter in &query.filters {
    let value = serde_json::to_string(&filter.value).unwrap_or_default();
    pairs.append_pair(
      "filter",
      &format!("{}:{}:{}", filter.field, filter.op.as_str(), value),
    );
  }
  if let Some(order) = &query.order_by {
    pairs.append_pair("order_by", &order.field);
    pairs.append_pair(
      "direction",
      match order.direction {
        super::Direction::Asc => "asc",
        super::Direction::Desc => "desc",
      },
    );
  }
  if let Some(limit) = query.limit {
    pairs.append_pair("limit", &limit.to_string());
  }
}

/// Map an HTTP status onto the document-store error codes.
pub(crate) fn code_for_status(status: StatusCode) -> ErrorCode {
  match status.as_u16() {
    400 | 422 => ErrorCode::InvalidArgument,
    401 => ErrorCode::Unauthenticated,
    403 => ErrorCode::PermissionDenied,
    404 => ErrorCode::NotFound,
    408 | 504 => ErrorCode::DeadlineExceeded,
    409 => ErrorCode::AlreadyExists,
    429 => ErrorCode::ResourceExhausted,
    502 | 503 => ErrorCode::Unavailable,
    500..=599 => ErrorCode::Internal,
    _ => ErrorCode::Unknown,
  }
}

fn transport_error(e: reqwest::Error) -> BackendError {
  let code = if e.is_timeout() {
    ErrorCode::DeadlineExceeded
  } else if e.is_connect() || e.is_request() {
    ErrorCode::Unavailable
  } else {
    ErrorCode::Unknown
  };
  BackendError::new(code, e.to_string())
}

fn decode_error(e: reqwest::Error) -> BackendError {
  BackendError::new(ErrorCode::Internal, format!("Failed to decode response: {}", e))
}

#[async_trait]
impl Backend for HttpBackend {
  async fn fetch_many(&self, collection: &str, query: &Query) -> Result<Vec<Document>, BackendError> {
    let mut url = self.url(&[collection]);
    apply_query(&mut url, query);
    debug!(%url, "fetch_many");

    let response = self.send(self.request(Method::GET, url)).await?;
    response.json().await.map_err(decode_error)
  }

  async fn fetch_one(&self, collection: &str, id: &str) -> Result<Option<Document>, BackendError> {
    let url = self.url(&[collection, id]);
    match self.send(self.request(Method::GET, url)).await {
      Ok(response) => response.json().await.map(Some).map_err(decode_error),
      Err(e) if e.code == ErrorCode::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }

  async fn create(&self, collection: &str, data: Value) -> Result<String, BackendError> {
    let url = self.url(&[collection]);
    let response = self
      .send(self.request(Method::POST, url).json(&data))
      .await?;
    let created: ApiCreated = response.json().await.map_err(decode_error)?;
    Ok(created.id)
  }

  async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), BackendError> {
    let url = self.url(&[collection, id]);
    self
      .send(self.request(Method::PATCH, url).json(&patch))
      .await?;
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
    let url = self.url(&[collection, id]);
    self.send(self.request(Method::DELETE, url)).await?;
    Ok(())
  }
}
