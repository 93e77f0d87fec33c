use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use storefront_sync::cache::{item_key, query_key};
use storefront_sync::{
  Backend, BackendError, Config, ErrorCode, HttpBackend, KvStore, OfflineQueue, Query,
  ReadOptions, ResilienceContext, SqliteKvStore,
};

#[derive(Parser, Debug)]
#[command(name = "storefront-sync")]
#[command(about = "Inspect the storefront offline queue and the document store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Offline write queue maintenance
  #[command(subcommand)]
  Queue(QueueCommand),

  /// Fetch one document
  Get { collection: String, id: String },

  /// List the documents of a collection
  List {
    collection: String,
    #[arg(short, long)]
    limit: Option<usize>,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show queued operations in replay order
  List,
  /// Replay queued operations against the backend
  Drain,
  /// Return a failed operation to pending
  Requeue { id: u64 },
  /// Drop one operation
  Remove { id: u64 },
  /// Drop every queued operation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  match args.command {
    Command::Queue(QueueCommand::List) => print_json(&open_queue(&config)?.list_pending()?)?,
    Command::Queue(QueueCommand::Drain) => {
      let ctx = open_context(&config)?;
      let report = ctx.drain().await?;
      print_json(&report)?;
    }
    Command::Queue(QueueCommand::Requeue { id }) => {
      if !open_queue(&config)?.requeue(id)? {
        return Err(eyre!("No queued operation with id {}", id));
      }
    }
    Command::Queue(QueueCommand::Remove { id }) => open_queue(&config)?.remove(id)?,
    Command::Queue(QueueCommand::Clear) => open_queue(&config)?.clear()?,
    Command::Get { collection, id } => {
      let ctx = open_context(&config)?;
      let backend = Arc::clone(ctx.backend());
      let key = item_key(&collection, &id);
      let result = ctx
        .read(&key, ReadOptions::fresh(), move || {
          let backend = Arc::clone(&backend);
          let (collection, id) = (collection.clone(), id.clone());
          async move {
            let doc = backend.fetch_one(&collection, &id).await?;
            serde_json::to_value(doc).map_err(encode_error)
          }
        })
        .await?;
      print_json(&result.data)?;
    }
    Command::List { collection, limit } => {
      let ctx = open_context(&config)?;
      let backend = Arc::clone(ctx.backend());
      let mut query = Query::new();
      if let Some(limit) = limit {
        query = query.limit(limit);
      }
      let key = query_key(&collection, &query);
      let result = ctx
        .read(&key, ReadOptions::fresh(), move || {
          let backend = Arc::clone(&backend);
          let (collection, query) = (collection.clone(), query.clone());
          async move {
            let docs = backend.fetch_many(&collection, &query).await?;
            serde_json::to_value(docs).map_err(encode_error)
          }
        })
        .await?;
      print_json(&result.data)?;
    }
  }

  Ok(())
}

fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
  let path = config.queue_path()?;
  let store = SqliteKvStore::open(&path)
    .map_err(|e| eyre!("Failed to open queue database {}: {}", path.display(), e))?;
  Ok(Arc::new(store))
}

fn open_queue(config: &Config) -> Result<OfflineQueue> {
  Ok(OfflineQueue::open(open_store(config)?, config.queue.max_size)?)
}

fn open_context(config: &Config) -> Result<Arc<ResilienceContext>> {
  let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config.backend)?);
  Ok(ResilienceContext::new(config, backend, open_store(config)?)?)
}

/// Log to a daily file so stdout carries only command output.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "storefront-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter =
    EnvFilter::try_from_env("STOREFRONT_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

fn encode_error(e: serde_json::Error) -> BackendError {
  BackendError::new(ErrorCode::Internal, format!("Failed to encode documents: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
