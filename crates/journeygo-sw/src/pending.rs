//! Tracking for fire-and-forget store writes.

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Background writes that have been started but maybe not finished.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingWrites {
    pub(crate) async fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every write started so far. Returns how many were awaited.
    pub(crate) async fn wait(&self) -> usize {
        let mut waited = 0;
        loop {
            let batch = std::mem::take(&mut *self.handles.lock().await);
            if batch.is_empty() {
                return waited;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background cache write panicked");
                }
                waited += 1;
            }
        }
    }
}
