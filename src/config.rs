use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub rate_limit: RateLimitConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the REST document API (e.g. "https://api.example.com/v1")
  pub url: Option<String>,
  /// Transport-level timeout for a single HTTP request
  pub timeout_ms: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_size: usize,
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      ttl_secs: 300,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  /// Bucket capacity (burst size)
  pub max_tokens: f64,
  /// Tokens added per second
  pub refill_rate: f64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      max_tokens: 10.0,
      refill_rate: 1.0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Maximum number of queued writes; further writes are rejected
  pub max_size: usize,
  /// Pause between replayed operations during a drain
  pub replay_delay_ms: u64,
  /// SQLite file holding the queue (default: data dir)
  pub path: Option<PathBuf>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      replay_delay_ms: 100,
      path: None,
    }
  }
}

impl QueueConfig {
  pub fn replay_delay(&self) -> Duration {
    Duration::from_millis(self.replay_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts per operation, including the first
  pub max_retries: u32,
  pub base_delay_ms: u64,
  /// Upper bound for one attempt before it counts as a timeout
  pub attempt_timeout_ms: u64,
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      attempt_timeout_ms: 5000,
      jitter: true,
    }
  }
}

impl RetryConfig {
  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn attempt_timeout(&self) -> Duration {
    Duration::from_millis(self.attempt_timeout_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-sync/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storefront-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Reject settings the components cannot work with.
  pub fn validate(&self) -> Result<()> {
    if self.cache.max_size == 0 {
      return Err(eyre!("cache.max_size must be at least 1"));
    }
    if !(self.rate_limit.max_tokens >= 1.0) {
      return Err(eyre!("rate_limit.max_tokens must be at least 1"));
    }
    if !(self.rate_limit.refill_rate > 0.0) {
      return Err(eyre!("rate_limit.refill_rate must be positive"));
    }
    if self.queue.max_size == 0 {
      return Err(eyre!("queue.max_size must be at least 1"));
    }
    if self.retry.max_retries == 0 {
      return Err(eyre!("retry.max_retries must be at least 1"));
    }
    Ok(())
  }

  /// Queue database path, defaulting to the platform data directory.
  pub fn queue_path(&self) -> Result<PathBuf> {
    match &self.queue.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("offline.db")),
    }
  }

  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("storefront-sync"))
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks STOREFRONT_SYNC_TOKEN first, then STOREFRONT_API_TOKEN as fallback.
  pub fn api_token() -> Option<String> {
    std::env::var("STOREFRONT_SYNC_TOKEN")
      .or_else(|_| std::env::var("STOREFRONT_API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
