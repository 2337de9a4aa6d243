use crate::scheduler::StopSignal;
use crate::{log_debug, log_error, log_warn};
use tokio::signal;
use tokio::task::JoinHandle;

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log_error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log_error!("Failed to install SIGTERM handler: {}", err);
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
}

/// Translate the first termination signal into a cooperative stop request.
pub fn spawn_stop_listener(stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                if stop.request() {
                    log_warn!("Stop requested, waiting for in-flight migrations to finish");
                }
            }
            _ = stop.wait() => {
                log_debug!("Stop listener released");
            }
        }
    })
}
