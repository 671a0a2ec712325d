// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stops the driver and reconciler loops on SIGINT or SIGTERM.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawns a watcher that cancels the returned token on the first shutdown signal.
pub fn install_signal_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        tokio::select! {
            signal = next_signal() => {
                info!(signal, "shutdown requested, stopping ledger loops");
                trigger.cancel();
            }
            // Nothing to do if shutdown was requested another way.
            _ = trigger.cancelled() => {}
        }
    });

    shutdown
}

/// Resolves with the name of the first signal received.
#[cfg(unix)]
async fn next_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, only Ctrl+C will stop the service");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl+C"
}
