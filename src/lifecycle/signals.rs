//! OS signal handling.
//!
//! # Responsibilities
//! - Master: SIGTERM/SIGINT request a graceful stop, SIGHUP a rolling reload
//! - Worker: SIGTERM drains; SIGINT is left to the master, which
//!   receives it too when the terminal sends it to the whole process group
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT while stopping forces the stop through again
//! - Non-unix platforms only get Ctrl+C as stop

use crate::lifecycle::shutdown::Shutdown;
use crate::supervisor::SupervisorHandle;

/// Forward process signals to the master. Runs until the master is gone.
pub fn spawn_master_signals(handle: SupervisorHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = master_signals(handle).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    })
}

#[cfg(unix)]
async fn master_signals(handle: SupervisorHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        let delivered = tokio::select! {
            _ = terminate.recv() => { tracing::info!(signal = "SIGTERM", "Stop requested"); handle.stop() }
            _ = interrupt.recv() => { tracing::info!(signal = "SIGINT", "Stop requested"); handle.stop() }
            _ = hangup.recv() => { tracing::info!(signal = "SIGHUP", "Reload requested"); handle.reload() }
        };
        if !delivered {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn master_signals(handle: SupervisorHandle) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        tracing::info!(signal = "ctrl-c", "Stop requested");
        if !handle.stop() {
            return Ok(());
        }
    }
}

/// Drain a worker process on SIGTERM.
pub fn spawn_worker_signals(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = worker_signals(shutdown).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    })
}

#[cfg(unix)]
async fn worker_signals(shutdown: Shutdown) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            _ = terminate.recv() => {
                tracing::info!(signal = "SIGTERM", "Draining worker");
                shutdown.trigger();
            }
            _ = interrupt.recv() => {
                tracing::debug!(signal = "SIGINT", "Ignored; waiting for the master to disconnect");
            }
            _ = shutdown.wait() => return Ok(()),
        }
    }
}

#[cfg(not(unix))]
async fn worker_signals(shutdown: Shutdown) -> std::io::Result<()> {
    shutdown.wait().await;
    Ok(())
}
