use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. When `halt` is given it is cancelled first, so running jobs
/// start stopping their subprocesses while the worker stops taking new ones.
pub fn install_shutdown_handler(halt: Option<CancellationToken>) -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        if let Some(halt) = halt {
            tracing::info!("Forwarding shutdown to running jobs");
            halt.cancel();
        }
        token_clone.cancel();
    });

    Ok(token)
}
