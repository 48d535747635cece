use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::RateLimiter;

/// Background task that periodically deletes expired rate-limit windows.
///
/// Owned by `main`: started after the limiter is built and stopped after the
/// server drains, so no timer outlives the process's shutdown sequence.
pub struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Starts sweeping every `interval`. The task also stops when `parent` is cancelled.
    pub fn spawn(limiter: RateLimiter, interval: Duration, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Rate limit sweeper started");

            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; nothing has expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match limiter.sweep_expired(Utc::now()).await {
                            Ok(removed) => debug!(removed, "Swept expired rate limit records"),
                            Err(e) => error!(error = %e, "Rate limit sweep failed"),
                        }
                    }
                    _ = task_token.cancelled() => {
                        info!("Rate limit sweeper shutting down");
                        break;
                    }
                }
            }
        });

        Self { token, handle }
    }

    /// Cancels the task and waits for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Rate limit sweeper task panicked");
        }
    }
}
