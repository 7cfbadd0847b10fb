//! Graceful shutdown: signal handling and connection draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Counts open connections so shutdown can wait for them.
///
/// Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDrain {
    active: Arc<AtomicUsize>,
}

/// Held for the life of one connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(active_connections = count, "Connection closed");
    }
}

impl ConnectionDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> ConnectionGuard {
        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(active_connections = count, "Connection opened");
        ConnectionGuard {
            active: self.active.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait for every tracked connection to close.
    ///
    /// Returns `false` if `timeout` passed with connections still open.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let initial = self.active_count();
        if initial == 0 {
            return true;
        }
        info!(
            active_connections = initial,
            timeout_secs = timeout.as_secs(),
            "Draining connections"
        );

        let mut last_logged = initial;
        loop {
            let current = self.active_count();
            if current == 0 {
                info!(elapsed_ms = start.elapsed().as_millis(), "All connections drained");
                return true;
            }
            if start.elapsed() >= timeout {
                warn!(
                    remaining_connections = current,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, connections still open"
                );
                return false;
            }
            if current != last_logged {
                debug!(remaining_connections = current, "Draining");
                last_logged = current;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
