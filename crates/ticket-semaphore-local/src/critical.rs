use std::future::Future;
use std::process::ExitStatus;

use anyhow::Context;
use ticket_semaphore_core::{SemaphoreError, SemaphoreHandle};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

/// How the child process in the critical section ended.
#[derive(Debug)]
pub enum Outcome {
    Exited(ExitStatus),
    /// Shutdown was requested; the child was killed.
    Interrupted,
}

/// Result of running a command while holding a semaphore.
#[derive(Debug)]
pub struct CriticalRun {
    pub outcome: Outcome,
    /// Result of signaling the handle after the child finished.
    pub released: Result<(), SemaphoreError>,
}

/// Run `command` while holding `handle`, then release it.
///
/// If `shutdown` completes first the child is killed before the handle is
/// signaled. The handle is signaled on every path once the child is gone,
/// including when the child could not be spawned.
pub async fn run_holding<F>(
    handle: SemaphoreHandle,
    command: &[String],
    shutdown: F,
) -> anyhow::Result<CriticalRun>
where
    F: Future<Output = ()>,
{
    let (program, args) = command.split_first().context("No command given to run")?;

    let spawned = Command::new(program).args(args).kill_on_drop(true).spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            if let Err(release_err) = handle.signal().await {
                warn!("Failed to release semaphore after spawn error: {}", release_err);
            }
            return Err(e).with_context(|| format!("Failed to run {}", program));
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => status.map(Outcome::Exited),
        () = shutdown => {
            info!("Shutdown requested, killing {}", program);
            child.kill().await.map(|()| Outcome::Interrupted)
        }
    };

    // Release before reporting the child's outcome so waiters are not held up.
    let released = handle.signal().await;
    let outcome = outcome.with_context(|| format!("Failed to wait for {}", program))?;

    Ok(CriticalRun { outcome, released })
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
///
/// The listener task keeps the handlers installed for the life of the
/// process, so every phase of a run has to observe the receiver.
pub fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}

/// Resolves once `rx` has seen a shutdown request.
pub async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|&stop| stop).await.is_err() {
        // Sender gone without a request: never fire.
        std::future::pending::<()>().await;
    }
}
