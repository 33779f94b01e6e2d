//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the root scope; running pipelines see the cancellation,
//! terminate their process groups and clean up scratch trees before the
//! coordinator lets the process exit.

use super::scope::CancelScope;
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    root: CancelScope,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(grace: Duration) -> Self {
        Self {
            root: CancelScope::root(),
            grace,
        }
    }

    /// The root scope every operation derives from
    pub fn scope(&self) -> CancelScope {
        self.root.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT), then cancel the root scope
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling running operation...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling running operation...");
            }
        }

        self.root.cancel();
    }

    /// Run `operation` until it finishes or a signal arrives. After a signal
    /// the operation gets the grace period to observe cancellation and exit.
    pub async fn run<F, T>(&self, operation: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(operation);
        tokio::select! {
            output = &mut operation => return Some(output),
            _ = self.wait_for_signal() => {}
        }

        match tokio::time::timeout(self.grace, &mut operation).await {
            Ok(output) => {
                info!("Graceful shutdown complete");
                Some(output)
            }
            Err(_) => {
                warn!("Operation did not stop within {:?}, forcing exit", self.grace);
                None
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_completes_without_signal() {
        let coordinator = ShutdownCoordinator::default();
        let result = coordinator.run(async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_scope_is_shared_with_operations() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let scope = coordinator.scope();

        // Simulate the signal path
        coordinator.root.cancel();

        // Task observing the scope should complete
        let handle = tokio::spawn(async move { scope.done().await });
        handle.await.unwrap();
    }
}
