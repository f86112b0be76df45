//! Keeps watcher loops alive: a loop that panics (or returns) is restarted
//! after a backoff instead of silently leaving its sensors stale forever.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, warn};

/// Delay before restarting a failed watcher loop.
const RESTART_DELAY: Duration = Duration::from_secs(10);

/// Spawn `make_task()` and respawn it whenever it ends.
pub fn spawn<F, Fut>(name: impl Into<String>, make_task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make_task()).await {
                Ok(()) => warn!(watcher = %name, "watcher loop exited; restarting"),
                Err(e) if e.is_panic() => error!(watcher = %name, "watcher loop panicked: {e}"),
                // Cancelled: the runtime is shutting down.
                Err(_) => return,
            }
            sleep(RESTART_DELAY).await;
        }
    })
}
