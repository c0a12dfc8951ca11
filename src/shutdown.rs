use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Exit status used when a second signal cuts the graceful path short
const FORCED_EXIT_CODE: i32 = 130;

/// Cancel the returned token on the first SIGINT or SIGTERM.
///
/// The master then stops accepting and drops its workers; a worker stops
/// reconnecting. A second signal exits the process immediately, leaving any
/// running children to `kill_on_drop`.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn({
        let token = token.clone();
        async move {
            let name = next_signal(&mut sigterm, &mut sigint).await;
            tracing::info!(signal = name, "Shutting down");
            token.cancel();

            let name = next_signal(&mut sigterm, &mut sigint).await;
            tracing::warn!(signal = name, "Second signal, exiting now");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    Ok(token)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
