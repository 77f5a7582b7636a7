use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound on the wait between restarts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

fn backoff(retry: u32) -> Duration {
    Duration::from_millis(100 * retry as u64).min(MAX_BACKOFF)
}

/// Run a listener in its own tokio task and restart it whenever it fails or panics.
///
/// Restarts are unlimited with a linear backoff. The retry counter resets once the
/// service has stayed up for a minute.
pub fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut retries: u32 = 0;
        let mut last_restart = Instant::now();

        loop {
            info!("[supervisor] Starting service: {name}");

            let f = Arc::clone(&factory);
            let result = tokio::spawn(async move { f().await }).await;

            match result {
                Ok(Ok(())) => {
                    info!("[supervisor] {name} exited cleanly");
                    break;
                }
                Ok(Err(e)) => {
                    error!("[supervisor] {name} failed: {e:#}");
                }
                Err(join_error) => {
                    error!("[supervisor] {name} task panicked: {join_error}");
                }
            }

            if last_restart.elapsed() > Duration::from_secs(60) {
                retries = 0;
            }
            retries = retries.saturating_add(1);

            let wait = backoff(retries);
            warn!("[supervisor] {name} restarting in {wait:?} (attempt {retries})");
            tokio::time::sleep(wait).await;
            last_restart = Instant::now();
        }
    })
}
