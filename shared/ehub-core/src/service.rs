//! Service infrastructure for all microservices

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// Health status for liveness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness status for readiness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Standard trait all microservices must implement
#[async_trait]
pub trait EhubService: Send + Sync + 'static {
    /// Service identifier (e.g., "bi-realtime")
    fn service_id(&self) -> &'static str;

    /// Service version
    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Health check - is the service alive?
    async fn health(&self) -> HealthStatus;

    /// Readiness check - are all dependencies available?
    async fn ready(&self) -> ReadinessStatus;

    /// Start the service. Runs until `shutdown` is cancelled.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Graceful shutdown, called after the root token has been cancelled
    async fn shutdown(&self) -> Result<()>;
}

/// Standard microservice runtime bootstrap
pub struct MicroserviceRuntime {
    grace_period: Duration,
    start_time: std::time::Instant,
}

impl MicroserviceRuntime {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            start_time: std::time::Instant::now(),
        }
    }

    /// Run a microservice with standard lifecycle management.
    ///
    /// The root [`CancellationToken`] is cancelled on SIGINT/SIGTERM or when
    /// `start` returns on its own; every worker the service spawns should hold
    /// a child of it.
    pub async fn run<S: EhubService>(&self, service: Arc<S>) -> Result<()> {
        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting microservice"
        );

        let root = CancellationToken::new();
        let service_clone = service.clone();
        let token = root.clone();
        let mut service_handle = tokio::spawn(async move {
            let result = service_clone.start(token.clone()).await;
            token.cancel();
            result
        });

        tokio::select! {
            _ = Self::wait_for_shutdown() => {
                info!("Shutdown signal received, gracefully stopping...");
            }
            _ = root.cancelled() => {
                warn!("Service exited before shutdown signal");
            }
        }
        root.cancel();

        if let Err(e) = service.shutdown().await {
            warn!("Error during shutdown: {}", e);
        }

        match tokio::time::timeout(self.grace_period, &mut service_handle).await {
            Ok(Ok(Err(e))) => error!("Service error: {}", e),
            Ok(Err(e)) => error!("Service task panicked: {}", e),
            Err(_) => {
                warn!(
                    grace_secs = self.grace_period.as_secs(),
                    "Service did not stop within grace period, aborting"
                );
                service_handle.abort();
            }
            Ok(Ok(Ok(()))) => {}
        }

        info!(
            uptime_seconds = self.start_time.elapsed().as_secs(),
            "Microservice stopped"
        );

        Ok(())
    }

    async fn wait_for_shutdown() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
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
}

impl Default for MicroserviceRuntime {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ShortLived {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl EhubService for ShortLived {
        fn service_id(&self) -> &'static str {
            "short-lived"
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus {
                healthy: true,
                service_id: self.service_id().to_string(),
                version: self.version().to_string(),
                uptime_seconds: 0,
            }
        }

        async fn ready(&self) -> ReadinessStatus {
            ReadinessStatus { ready: true, dependencies: vec![] }
        }

        async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runtime_stops_when_service_exits() {
        let service = Arc::new(ShortLived { stopped: AtomicBool::new(false) });
        let runtime = MicroserviceRuntime::new(Duration::from_secs(1));
        runtime.run(service.clone()).await.unwrap();
        assert!(service.stopped.load(Ordering::SeqCst));
    }
}
