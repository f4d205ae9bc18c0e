use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use super::coordinator::TideCoordinator;

/// Runner handle.
/// - `shutdown_tx` を drop しても drive ループは止まる
/// - `shutdown_and_join()` で tide の退役まで待てる
pub struct TideRunner {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TideRunner {
    pub fn spawn(coordinator: Arc<TideCoordinator>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { coordinator.run(shutdown_rx).await });
        Self { shutdown_tx, join }
    }

    /// Stop taking new tasks. In-flight handler execution is not cancelled;
    /// the drive loop exits after the current task.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Shutdown and wait for the drive loop (and tide retirement).
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(error = %e, "tide runner task ended abnormally");
        }
    }
}
