//! Pause and cancellation signals shared by the stage tasks.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Per-stage view of the job's control signals.
#[derive(Debug, Clone)]
pub struct StageControl {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl StageControl {
    pub fn new(cancel: CancellationToken, paused: watch::Receiver<bool>) -> Self {
        Self { cancel, paused }
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Block while the job is paused. Returns `false` if the job was
    /// cancelled instead of resumed.
    pub async fn wait_if_paused(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !*self.paused.borrow() {
            return true;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            // A dropped sender means the controller is gone; carry on.
            _ = self.paused.wait_for(|paused| !*paused) => !self.cancel.is_cancelled(),
        }
    }
}
