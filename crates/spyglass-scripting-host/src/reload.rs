use tokio::sync::watch;
#[cfg(unix)]
use tracing::{error, info};
#[cfg(not(unix))]
use tracing::warn;

/// A reload was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal;

/// Spawn a SIGUSR2 handler; the receiver sees `Some(ReloadSignal)` briefly
/// after each signal
#[cfg(unix)]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                error!(target: "scripting", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = reload_tx.closed() => {
                    info!(target: "scripting", "Reload receiver dropped, stopping SIGUSR2 handler");
                    break;
                }
                received = sigusr2.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            info!(target: "scripting", "Received SIGUSR2, refreshing scripts");
            if reload_tx.send(Some(ReloadSignal)).is_err() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            let _ = reload_tx.send(None);
        }
    });

    reload_rx
}

#[cfg(not(unix))]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    warn!(target: "scripting", "SIGUSR2 reload not supported on this platform");
    // Never sends; keeps the receiver from seeing a closed channel
    std::mem::forget(reload_tx);
    reload_rx
}
