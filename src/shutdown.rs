//! Signal-driven shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, finishing in-flight jobs"),
        _ = wait_for_ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt, finishing in-flight jobs"),
        Err(e) => {
            warn!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Install a handler for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either arrives. Running solver
/// processes are not signalled; the dispatcher waits for them.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}
