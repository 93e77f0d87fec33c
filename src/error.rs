//! Error taxonomy for the data-access layer.
//!
//! Backend collaborators report [`BackendError`]s carrying a document-store
//! [`ErrorCode`]. The orchestrator classifies those codes and wraps whatever
//! reaches the caller in an [`AccessError`] with an [`ErrorContext`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes reported by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
  PermissionDenied,
  Unauthenticated,
  InvalidArgument,
  NotFound,
  AlreadyExists,
  ResourceExhausted,
  Unavailable,
  DeadlineExceeded,
  Internal,
  Unknown,
}

impl ErrorCode {
  /// Terminal codes cannot be fixed by retrying the same request.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      ErrorCode::PermissionDenied | ErrorCode::Unauthenticated | ErrorCode::InvalidArgument
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorCode::PermissionDenied => "permission-denied",
      ErrorCode::Unauthenticated => "unauthenticated",
      ErrorCode::InvalidArgument => "invalid-argument",
      ErrorCode::NotFound => "not-found",
      ErrorCode::AlreadyExists => "already-exists",
      ErrorCode::ResourceExhausted => "resource-exhausted",
      ErrorCode::Unavailable => "unavailable",
      ErrorCode::DeadlineExceeded => "deadline-exceeded",
      ErrorCode::Internal => "internal",
      ErrorCode::Unknown => "unknown",
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Error returned by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
  pub code: ErrorCode,
  pub message: String,
}

impl BackendError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.code.is_terminal()
  }

  pub fn timeout(after: std::time::Duration) -> Self {
    Self::new(
      ErrorCode::DeadlineExceeded,
      format!("attempt timed out after {}ms", after.as_millis()),
    )
  }
}

/// Where and when an error surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
  /// Logical operation name (e.g. "read", "write:update")
  pub operation: String,
  /// Cache key or resource the operation targeted
  pub key: String,
  pub at: DateTime<Utc>,
}

impl ErrorContext {
  pub fn new(operation: impl Into<String>, key: impl Into<String>) -> Self {
    Self {
      operation: operation.into(),
      key: key.into(),
      at: Utc::now(),
    }
  }
}

impl fmt::Display for ErrorContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} [{}] at {}", self.operation, self.key, self.at.to_rfc3339())
  }
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite: {0}")]
  Sqlite(String),
  #[error("store lock poisoned")]
  Poisoned,
  #[error("io: {0}")]
  Io(String),
  #[error("corrupt entry {key}: {message}")]
  Codec { key: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Sqlite(e.to_string())
  }
}

/// Caller-visible errors of the data-access layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
  /// The backend rejected the request in a way retrying cannot fix.
  #[error("{context}: terminal backend error: {source}")]
  Terminal {
    context: ErrorContext,
    source: BackendError,
  },

  /// Every permitted attempt failed with a retryable error.
  #[error("{context}: gave up after {attempts} attempts: {source}")]
  RetryExhausted {
    context: ErrorContext,
    attempts: u32,
    source: BackendError,
  },

  /// The rate limiter denied admission; try again shortly.
  #[error("{context}: rate limited")]
  RateLimited { context: ErrorContext },

  /// The offline queue is at capacity and the write was rejected.
  #[error("{context}: offline queue full ({capacity} operations)")]
  QueueFull {
    context: ErrorContext,
    capacity: usize,
  },

  #[error("{context}: storage error: {source}")]
  Storage {
    context: ErrorContext,
    source: StoreError,
  },

  #[error("{context}: serialization error: {message}")]
  Serialization {
    context: ErrorContext,
    message: String,
  },

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl AccessError {
  pub fn context(&self) -> Option<&ErrorContext> {
    match self {
      AccessError::Terminal { context, .. }
      | AccessError::RetryExhausted { context, .. }
      | AccessError::RateLimited { context }
      | AccessError::QueueFull { context, .. }
      | AccessError::Storage { context, .. }
      | AccessError::Serialization { context, .. } => Some(context),
      AccessError::Config(_) => None,
    }
  }

  /// The underlying backend error, if the failure came from the backend.
  pub fn backend_error(&self) -> Option<&BackendError> {
    match self {
      AccessError::Terminal { source, .. } | AccessError::RetryExhausted { source, .. } => {
        Some(source)
      }
      _ => None,
    }
  }

  /// Whether the caller may reasonably try the same call again later.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      AccessError::RetryExhausted { .. } | AccessError::RateLimited { .. }
    )
  }

  pub(crate) fn storage(context: ErrorContext, source: StoreError) -> Self {
    AccessError::Storage { context, source }
  }

  pub(crate) fn serialization(context: ErrorContext, e: impl fmt::Display) -> Self {
    AccessError::Serialization {
      context,
      message: e.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_terminal_codes() {
    assert!(ErrorCode::PermissionDenied.is_terminal());
    assert!(ErrorCode::Unauthenticated.is_terminal());
    assert!(ErrorCode::InvalidArgument.is_terminal());
    assert!(!ErrorCode::Unavailable.is_terminal());
    assert!(!ErrorCode::NotFound.is_terminal());
    assert!(!ErrorCode::DeadlineExceeded.is_terminal());
  }

  #[test]
  fn test_code_serializes_kebab_case() {
    let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
    assert_eq!(json, "\"permission-denied\"");
    assert_eq!(ErrorCode::ResourceExhausted.to_string(), "resource-exhausted");
  }

  #[test]
  fn test_access_error_carries_context() {
    let err = AccessError::QueueFull {
      context: ErrorContext::new("write:update", "products:p1"),
      capacity: 100,
    };
    let context = err.context().unwrap();
    assert_eq!(context.operation, "write:update");
    assert_eq!(context.key, "products:p1");
    assert!(err.to_string().contains("offline queue full"));
    assert!(!err.is_retryable());
  }
}
