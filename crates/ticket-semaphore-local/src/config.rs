use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ticket_semaphore_core::{
    SemaphoreOptions, DEFAULT_REFRESH_INTERVAL_MICROS, DEFAULT_VALIDITY_SECS,
};

/// Configuration for the ticket-semaphore-local CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "ticket-semaphore-local")]
#[command(about = "Cross-process named semaphores over a shared directory")]
pub struct Config {
    /// Shared store directory. Every cooperating process must point at the same one.
    #[arg(long, global = true, env = "SEMAPHORE_DIR")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Provision the store directory
    Init,

    /// Acquire a semaphore, run a command while holding it, then release it
    Run {
        /// Semaphore name
        name: String,

        #[command(flatten)]
        lease: LeaseArgs,

        /// Command to run in the critical section
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// List tickets queued for a semaphore
    List {
        /// Semaphore name
        name: String,
    },

    /// Delete expired tickets
    Reap {
        /// Only reap this semaphore (default: all)
        name: Option<String>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct LeaseArgs {
    /// Lease length in seconds
    #[arg(long, default_value_t = DEFAULT_VALIDITY_SECS, env = "SEMAPHORE_VALIDITY")]
    pub validity: u64,

    /// Delay between readiness checks in microseconds
    #[arg(
        long,
        default_value_t = DEFAULT_REFRESH_INTERVAL_MICROS,
        env = "SEMAPHORE_REFRESH_INTERVAL"
    )]
    pub refresh_interval: u64,
}

impl LeaseArgs {
    pub fn options(&self) -> SemaphoreOptions {
        SemaphoreOptions::default()
            .with_validity(Duration::from_secs(self.validity))
            .with_refresh_interval(Duration::from_micros(self.refresh_interval))
    }
}

impl Config {
    /// Get the effective store directory.
    pub fn effective_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ticket-semaphore")
                .join("store")
        })
    }
}
