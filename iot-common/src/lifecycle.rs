//! Shutdown plumbing shared by the binaries: signal trapping and bounded
//! draining of loop tasks.
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to register SIGTERM handler, only SIGINT is trapped: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to wait for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    };
}

/// Cancel `shutdown` when the process is asked to stop.
pub fn trap_shutdown_signals(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                info!("shutting down gracefully...");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

/// Wait at most `grace_period` for `task` to finish, aborting it afterwards.
///
/// Returns the task output if it finished in time.
pub async fn drain<T>(name: &str, task: JoinHandle<T>, grace_period: Duration) -> Option<T> {
    let abort = task.abort_handle();

    match tokio::time::timeout(grace_period, task).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            error!(task = name, "task did not complete: {}", e);
            None
        }
        Err(_) => {
            warn!(task = name, ?grace_period, "grace period elapsed, aborting task");
            abort.abort();
            None
        }
    }
}
