//! Long-running loops: metadata producer, download drain and auto-delete.
//! Each sleeps on its own cadence and exits when the shutdown token fires.

pub mod auto_delete;
pub mod producer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::download::{DownloadError, DownloadScheduler};

pub use self::auto_delete::AutoDeleter;
pub use self::producer::Producer;

/// Sleep lengths between loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub after_error: Duration,
    pub after_success: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            after_error: Duration::from_secs(60),
            after_success: Duration::from_secs(60 * 60),
        }
    }
}

impl Cadence {
    fn pause(&self, ok: bool) -> Duration {
        if ok {
            self.after_success
        } else {
            self.after_error
        }
    }
}

/// Nudges the download loop out of its sleep when new work lands.
/// A notification sent while nobody sleeps is dropped.
#[derive(Debug, Default)]
pub struct Wake {
    notify: Notify,
}

impl Wake {
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Sleep for `duration` unless woken first. Returns `false` if the
    /// token was cancelled.
    pub async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => {
                tracing::debug!("Woken early by new work");
                true
            }
            _ = cancel.cancelled() => false,
        }
    }
}

/// Returns `false` if the token was cancelled during the sleep.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Drain the pending set forever. Ends cleanly on shutdown or once the
/// `stop_after` quota is met; budget exhaustion is returned as an error.
pub async fn download_loop(
    scheduler: Arc<DownloadScheduler>,
    wake: Arc<Wake>,
    cadence: Cadence,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let ok = match scheduler.drain(&cancel).await {
            Ok(report) => report.is_clean(),
            Err(e @ DownloadError::BudgetExhausted { .. }) => {
                tracing::error!(error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "Download drain failed");
                false
            }
        };
        if scheduler.stop_reached() {
            tracing::info!(
                transferred = scheduler.transferred(),
                "Download quota reached, stopping"
            );
            return Ok(());
        }
        let pause = cadence.pause(ok);
        tracing::debug!(pause_secs = pause.as_secs(), "Download loop sleeping");
        if !wake.sleep(pause, &cancel).await {
            return Ok(());
        }
    }
}
