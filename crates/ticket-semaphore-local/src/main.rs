mod config;
mod critical;
mod store;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config, LeaseArgs};
use critical::{create_shutdown_signal, run_holding, shutdown_requested, Outcome};
use store::FileStore;
use ticket_semaphore_core::{SemaphoreError, SemaphoreService};

/// Exit code when the lease lapsed before the critical section finished.
const EXIT_EXPIRED: u8 = 3;
/// Exit code when the wait or the child was interrupted.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let dir = config.effective_dir();

    let store = FileStore::new(&dir);
    let service = SemaphoreService::new(Arc::new(store));
    service
        .init()
        .await
        .with_context(|| format!("Failed to provision store at {}", dir.display()))?;
    info!(
        "Using {} store at {}",
        service.store().backend_name(),
        dir.display()
    );

    match config.command {
        Command::Init => {
            info!("Store ready at {}", dir.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            name,
            lease,
            command,
        } => run(&service, &name, &lease, &command).await,
        Command::List { name } => {
            list(&service, &name).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reap { name } => {
            let purged = service.reap_expired(name.as_deref()).await?;
            println!("{}", purged);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Hold `name` for the duration of a child process.
async fn run(
    service: &SemaphoreService,
    name: &str,
    lease: &LeaseArgs,
    command: &[String],
) -> anyhow::Result<ExitCode> {
    let options = lease.options();
    info!(
        "Waiting for semaphore '{}' (validity {}s, refresh {}us)",
        name, options.validity, options.refresh_interval
    );

    // One receiver for the whole run: the wait and the child both observe it.
    let shutdown_rx = create_shutdown_signal();

    let waiting = service.wait_until(name, options, shutdown_requested(shutdown_rx.clone()));
    let handle = match waiting.await {
        Ok(handle) => handle,
        Err(SemaphoreError::Cancelled { .. }) => {
            warn!("Interrupted while waiting for semaphore '{}'", name);
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        "Acquired semaphore '{}' as ticket {} ({:?} left on lease)",
        name,
        handle.index(),
        handle.remaining()
    );

    let run = run_holding(handle, command, shutdown_requested(shutdown_rx)).await?;

    match run.released {
        Ok(()) => info!("Released semaphore '{}'", name),
        Err(e @ SemaphoreError::Expired { .. }) => {
            error!(
                "{}; the critical section ran past its lease \
                 and may have overlapped another holder",
                e
            );
            return Ok(ExitCode::from(EXIT_EXPIRED));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(match run.outcome {
        Outcome::Interrupted => {
            warn!("Interrupted while holding semaphore '{}'", name);
            ExitCode::from(EXIT_CANCELLED)
        }
        Outcome::Exited(status) => match status.code() {
            Some(0) => ExitCode::SUCCESS,
            Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            None => ExitCode::FAILURE,
        },
    })
}

async fn list(service: &SemaphoreService, name: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp();
    for ticket in service.tickets(name).await? {
        let expires = chrono::DateTime::from_timestamp(ticket.expiration_time, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| ticket.expiration_time.to_string());
        let state = if ticket.is_live_at(now) { "live" } else { "expired" };
        println!("{}\t{}\t{}", ticket.index, expires, state);
    }
    Ok(())
}
