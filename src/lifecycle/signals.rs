//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers config reload, not shutdown

use std::io;

/// What an OS signal asks the proxy to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Wait for the next signal the proxy reacts to.
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let event = tokio::select! {
        _ = terminate.recv() => SignalEvent::Shutdown,
        _ = interrupt.recv() => SignalEvent::Shutdown,
        _ = hangup.recv() => SignalEvent::Reload,
    };
    tracing::info!(event = ?event, "Signal received");
    Ok(event)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(event = ?SignalEvent::Shutdown, "Signal received");
    Ok(SignalEvent::Shutdown)
}
