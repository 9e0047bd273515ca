use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use discovery::k8s::KubernetesError;
use error_stack::Report;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::task::JoinHandle;

use crate::api::handlers::SharedDiscovery;
use crate::api::ApiServer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Task manager, responsible for starting and managing all background tasks
#[derive(Default)]
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    shutdown_senders: Vec<oneshot::Sender<()>>,
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_api_server(&mut self, discovery: SharedDiscovery, listen_addr: String) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let api_server = ApiServer::new(discovery, listen_addr);
        let task = tokio::spawn(async move {
            tracing::info!("Starting API server task");
            if let Err(e) = api_server.run(shutdown_rx).await {
                tracing::error!("API server failed: {e:?}");
            }
            tracing::info!("API server task completed");
        });
        self.shutdown_senders.push(shutdown_tx);
        self.tasks.push(task);
    }

    /// wait for a shutdown signal, a fatal watch error, or a task exiting
    pub async fn wait_for_completion<F>(&mut self, fatal: F) -> Result<()>
    where
        F: Future<Output = Option<Report<KubernetesError>>>,
    {
        let mut signal_handler = shutdown_signal()?;

        let exit = tokio::select! {
            _ = &mut signal_handler => Exit::Signal,
            Some(report) = fatal => Exit::Fatal(report),
            (result, index) = first_exited(&mut self.tasks) => Exit::Task(index, result),
        };
        signal_handler.abort();

        let outcome = match exit {
            Exit::Signal => {
                tracing::info!("Shutdown signal received, stopping tasks");
                Ok(())
            }
            Exit::Fatal(report) => {
                tracing::error!("Watch failed permanently: {report:?}");
                Err(anyhow::anyhow!("{report:?}"))
            }
            Exit::Task(index, result) => {
                self.tasks.remove(index);
                match result {
                    Ok(()) => {
                        tracing::warn!("Task completed unexpectedly");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        Err(e.into())
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    async fn shutdown(&mut self) {
        for sender in self.shutdown_senders.drain(..) {
            let _ = sender.send(());
        }
        tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        });
        self.tasks.clear();
    }
}

enum Exit {
    Signal,
    Fatal(Report<KubernetesError>),
    Task(usize, Result<(), JoinError>),
}

async fn first_exited(tasks: &mut [JoinHandle<()>]) -> (Result<(), JoinError>, usize) {
    if tasks.is_empty() {
        return std::future::pending().await;
    }
    let (result, index, _remaining) = futures::future::select_all(tasks.iter_mut()).await;
    (result, index)
}

fn shutdown_signal() -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                return;
            }
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }))
    }
}
