//! Interrupt handling.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Exit status when a second interrupt aborts the process.
pub const INTERRUPTED_EXIT: i32 = 130;

/// Cancel on the first interrupt, then wait for a second one.
///
/// Returns `true` once the second interrupt arrives, `false` if the
/// interrupt source fails first.
pub async fn wait_for_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    tracing::warn!("Interrupted, stopping uploads (press Ctrl-C again to exit)");
    cancel.cancel();

    interrupt().await.is_ok()
}
