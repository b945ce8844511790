use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolve on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(
                "failed to install SIGTERM handler, only SIGINT stops the process: {}",
                err
            );
            if ctrl_c.await.is_ok() {
                info!("received SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

/// A token cancelled when the process receives SIGINT or SIGTERM. Must be
/// called from within a tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        trigger.cancel();
    });
    token
}
