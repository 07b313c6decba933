//! Background tasks: fixed-interval maintenance owned by a service.
//!
//! The registry and the response cache each run one sweep on a ticker. A
//! [`PeriodicTask`] is started by its owner and stopped by its owner: either
//! explicitly through [`PeriodicTask::shutdown`], which waits for the loop to
//! exit, or implicitly on drop, which cancels it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a spawned fixed-interval task.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use visara_gateway::background::PeriodicTask;
///
/// # async fn example() {
/// let task = PeriodicTask::spawn("heartbeat", Duration::from_secs(1), || {
///     tracing::debug!("tick");
/// });
/// task.shutdown().await;
/// # }
/// ```
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `tick` onto the current Tokio runtime, to run once every `period`.
    ///
    /// The first run happens one full `period` after spawning. Ticks missed
    /// while `tick` was running are skipped rather than replayed in a burst.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero or if called outside a Tokio runtime.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(task = name, period = ?period, "periodic task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!(task = name, "periodic task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        debug!(task = name, "periodic task tick");
                        tick();
                    }
                }
            }
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancels the task and waits for its loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
