//! Online/offline state with change notification.
//!
//! The host environment feeds connectivity signals into
//! [`ConnectionMonitor::set_online`]; nothing here polls the network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::info;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Listeners {
  entries: Mutex<Vec<(u64, Listener)>>,
  next_id: AtomicU64,
}

impl Listeners {
  fn lock(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Tracks the process-wide connection state.
pub struct ConnectionMonitor {
  online: AtomicBool,
  // Serializes transitions so notifications leave in transition order
  transition: Mutex<()>,
  listeners: Arc<Listeners>,
}

impl ConnectionMonitor {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
      transition: Mutex::new(()),
      listeners: Arc::new(Listeners::default()),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Apply a connectivity signal.
  ///
  /// A real transition notifies every subscriber synchronously, in
  /// registration order, before returning `true`. Repeating the current
  /// state is a no-op and returns `false`. Listeners must not call back
  /// into `set_online`.
  pub fn set_online(&self, online: bool) -> bool {
    let _transition = self
      .transition
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if self.online.swap(online, Ordering::SeqCst) == online {
      return false;
    }
    info!(online, "connection state changed");

    // Snapshot so listeners may subscribe or unsubscribe while being notified
    let snapshot: Vec<Listener> = self
      .listeners
      .lock()
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();
    for listener in snapshot {
      listener(online);
    }
    true
  }

  /// Register a callback for state transitions.
  ///
  /// The callback stays registered until the returned [`Subscription`] is
  /// dropped or explicitly unsubscribed.
  pub fn on_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let id = self.listeners.next_id.fetch_add(1, Ordering::SeqCst);
    self.listeners.lock().push((id, Arc::new(callback)));
    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.listeners.lock().len()
  }

  /// Change state without notifying anyone.
  #[cfg(test)]
  pub(crate) fn force_state(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Default for ConnectionMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Handle for a registered connection listener; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
  id: u64,
  listeners: Weak<Listeners>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(listeners) = self.listeners.upgrade() {
      listeners.lock().retain(|(id, _)| *id != self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}
