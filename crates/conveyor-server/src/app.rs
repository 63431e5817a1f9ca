//! Application assembly.

use conveyor_config::AppConfig;
use conveyor_core::{ConveyorError, ConveyorResult};
use conveyor_handlers::builtin_registry;
use conveyor_jobs::{connect_broker, Broker, JobRegistry, WorkerPool, WorkerPoolConfig};
use conveyor_rest::{create_router, AppState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// A fully wired process: broker connection, registry, and whichever of the
/// HTTP API and worker pool the deployment role asks for.
pub struct Application {
    config: AppConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    pool: Option<WorkerPool>,
    listener: Option<TcpListener>,
}

impl Application {
    /// Connects the broker, builds the registry and binds the HTTP listener.
    pub async fn build(config: AppConfig) -> ConveyorResult<Self> {
        let broker = connect_broker(&config.jobs).await?;
        let registry = Arc::new(builtin_registry(&config.jobs, &config.handlers)?);

        info!(
            backend = ?config.jobs.broker.backend,
            ack_mode = ?broker.ack_mode(),
            kinds = registry.len(),
            "Job subsystem ready"
        );

        let role = config.deployment.role;

        let pool = role.has_workers().then(|| {
            WorkerPool::new(
                broker.clone(),
                registry.clone(),
                WorkerPoolConfig::from(&config.jobs.worker),
            )
        });

        let listener = if role.has_api() {
            let addr = config.server.addr();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| ConveyorError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
            Some(listener)
        } else {
            None
        };

        Ok(Self {
            config,
            broker,
            registry,
            pool,
            listener,
        })
    }

    /// Address the HTTP API is bound to, if this role serves it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn has_workers(&self) -> bool {
        self.pool.is_some()
    }

    /// Runs until `shutdown` resolves, then drains workers and closes the
    /// broker.
    pub async fn run_until<F>(self, shutdown: F) -> ConveyorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(pool) = &self.pool {
            pool.start().await?;
        }

        let served = match self.listener {
            Some(listener) => {
                let state = AppState::new(
                    self.broker.clone(),
                    self.registry.clone(),
                    &self.config.jobs.dispatch,
                );
                let router = create_router(state, &self.config.server);
                info!("Serving HTTP API on http://{}", self.config.server.addr());

                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                    .map_err(|e| ConveyorError::Internal(format!("HTTP server error: {}", e)))
            }
            None => {
                shutdown.await;
                Ok(())
            }
        };

        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        self.broker.close().await;

        info!("Application shutdown complete");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::DeploymentRole;
    use conveyor_jobs::{BrokerBackend, JobArguments, Job};
    use std::time::Duration;

    fn memory_config(role: DeploymentRole, processed: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.deployment.role = role;
        config.jobs.broker.backend = BrokerBackend::Memory;
        config.jobs.worker.concurrency = 1;
        config.handlers.processed_dir = processed.to_path_buf();
        config.handlers.test_task_delay_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_api_role_binds_without_workers() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::build(memory_config(DeploymentRole::Api, dir.path()))
            .await
            .unwrap();

        assert!(app.local_addr().is_some());
        assert!(!app.has_workers());
        assert_eq!(app.registry().len(), 3);
    }

    #[tokio::test]
    async fn test_worker_role_has_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::build(memory_config(DeploymentRole::Worker, dir.path()))
            .await
            .unwrap();

        assert!(app.local_addr().is_none());
        assert!(app.has_workers());
    }

    #[tokio::test]
    async fn test_run_processes_jobs_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::build(memory_config(DeploymentRole::All, dir.path()))
            .await
            .unwrap();
        let broker = app.broker();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(app.run_until(async {
            let _ = rx.await;
        }));

        let job = Job::new("test-task", JobArguments::new().with("file_id", 1));
        broker.submit(&job).await.unwrap();

        let mut finished = false;
        for _ in 0..200 {
            if let Some(result) = broker.get_result(&job.id).await.unwrap() {
                if result.is_terminal() {
                    finished = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(broker.health_check().await.is_err());
    }
}
