//! Background reclamation of expired cache rows

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::db::RowStore;

/// Bound on how long `stop(wait = true)` waits for the task to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically deletes rows whose expiry instant has passed.
///
/// Correctness of reads never depends on the reaper: the liveness filter
/// already hides expired rows. The reaper only reclaims the storage they
/// occupy. It waits a grace period after `start`, then sweeps on a fixed
/// interval until stopped.
pub struct ExpiryReaper {
  store: Arc<dyn RowStore>,
  grace: Duration,
  interval: Duration,
  shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryReaper {
  pub fn new(store: Arc<dyn RowStore>, grace: Duration, interval: Duration) -> Self {
    Self {
      store,
      grace,
      interval,
      shutdown_tx: Mutex::new(None),
      handle: Mutex::new(None),
    }
  }

  /// Spawn the background sweep task. Idempotent while the task is alive.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn start(&self) {
    if self.is_running() {
      return;
    }
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(run_sweep_loop(
      self.store.clone(),
      self.grace,
      self.interval,
      rx,
    ));
    *self.shutdown_tx.lock() = Some(tx);
    *self.handle.lock() = Some(handle);
    tracing::info!("Started background cache sweep task");
  }

  /// Whether the background sweep task is alive
  pub fn is_running(&self) -> bool {
    self
      .handle
      .lock()
      .as_ref()
      .map(|h| !h.is_finished())
      .unwrap_or(false)
  }

  /// Run one deletion pass immediately and return the number of rows
  /// removed. Store faults are logged and yield 0.
  pub async fn sweep_now(&self) -> usize {
    match self.store.delete_expired(Utc::now()).await {
      Ok(count) => count,
      Err(e) => {
        tracing::warn!("Error during manual cache sweep: {}", e);
        0
      }
    }
  }

  /// Signal the background task to exit. With `wait`, block up to a
  /// bounded timeout for confirmation.
  pub async fn stop(&self, wait: bool) {
    let tx = self.shutdown_tx.lock().take();
    if let Some(tx) = tx {
      let _ = tx.send(());
    }
    if wait {
      let handle = self.handle.lock().take();
      if let Some(handle) = handle {
        if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
          tracing::warn!("Cache sweep task did not stop within {:?}", JOIN_TIMEOUT);
        }
      }
    }
  }
}

async fn run_sweep_loop(
  store: Arc<dyn RowStore>,
  grace: Duration,
  interval: Duration,
  mut shutdown: oneshot::Receiver<()>,
) {
  tokio::select! {
    _ = tokio::time::sleep(grace) => {}
    _ = &mut shutdown => {
      tracing::info!("Cache sweep task stopped");
      return;
    }
  }

  loop {
    // A failed sweep must never kill the task; the next tick retries
    match store.delete_expired(Utc::now()).await {
      Ok(count) if count > 0 => tracing::debug!("Swept {} expired cache rows", count),
      Ok(_) => {}
      Err(e) => tracing::warn!("Error during scheduled cache sweep: {}", e),
    }

    tokio::select! {
      _ = tokio::time::sleep(interval) => {}
      _ = &mut shutdown => break,
    }
  }

  tracing::info!("Cache sweep task stopped");
}
