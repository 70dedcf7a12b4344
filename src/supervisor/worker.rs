//! Worker spawning abstraction and the in-process task spawner.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::WorkerServer;
use crate::lifecycle::Shutdown;
use crate::modules::ModuleRegistry;

pub type WorkerId = u64;

/// What a worker reports back to the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Every configured listener is bound.
    Listening(WorkerId),
    /// The worker is gone. `code` is `None` when it was killed or panicked.
    Exited { id: WorkerId, code: Option<i32> },
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Master-side handle on one running worker.
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> WorkerId;

    /// OS process id, or the master's own pid for in-process workers.
    fn pid(&self) -> u32;

    /// Ask the worker to stop accepting and exit once in-flight requests finish.
    fn disconnect(&self);

    /// Terminate without draining.
    fn kill(&self);
}

/// Starts workers. Events for the new worker must be sent on `events`.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        id: WorkerId,
        config: Arc<GatewayConfig>,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError>;
}

/// Runs each worker as a tokio task inside the master process.
///
/// A failing or panicking worker task is contained by the runtime and reported as an exit.
pub struct TaskSpawner {
    registry: Arc<ModuleRegistry>,
}

impl TaskSpawner {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        config: Arc<GatewayConfig>,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError> {
        let shutdown = Shutdown::new();
        let drain = shutdown.clone();
        let registry = Arc::clone(&self.registry);
        let listening = events.clone();

        let task = tokio::spawn(async move {
            let server = WorkerServer::from_config(config, &registry)?;
            server
                .run(drain, |addrs| {
                    tracing::info!(worker_id = id, addresses = ?addrs, "Worker listening");
                    let _ = listening.send(WorkerEvent::Listening(id));
                })
                .await
        });
        let abort = task.abort_handle();

        tokio::spawn(async move {
            let code = match task.await {
                Ok(Ok(())) => Some(0),
                Ok(Err(e)) => {
                    tracing::error!(worker_id = id, error = %e, "Worker failed");
                    Some(1)
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(worker_id = id, "Worker panicked");
                    None
                }
                Err(_) => None,
            };
            let _ = events.send(WorkerEvent::Exited { id, code });
        });

        Ok(Box::new(TaskHandle { id, shutdown, abort }))
    }
}

struct TaskHandle {
    id: WorkerId,
    shutdown: Shutdown,
    abort: AbortHandle,
}

impl WorkerHandle for TaskHandle {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn disconnect(&self) {
        self.shutdown.trigger();
    }

    fn kill(&self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModuleConfig, ModuleRef, WorkflowConfig};
    use std::time::Duration;

    fn config() -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::default();
        config.host = "127.0.0.1".into();
        config.ports.http = Some(0);
        Arc::new(config)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn task_worker_reports_listening_and_drains() {
        let spawner = TaskSpawner::new(Arc::new(ModuleRegistry::with_builtins()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawner.spawn(7, config(), tx).unwrap();
        assert_eq!(next(&mut rx).await, WorkerEvent::Listening(7));
        assert_eq!(handle.pid(), std::process::id());

        handle.disconnect();
        assert_eq!(next(&mut rx).await, WorkerEvent::Exited { id: 7, code: Some(0) });
    }

    #[tokio::test]
    async fn broken_config_exits_without_listening() {
        let spawner = TaskSpawner::new(Arc::new(ModuleRegistry::with_builtins()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut broken = (*config()).clone();
        broken.workflows.insert(
            "api".into(),
            WorkflowConfig {
                proxies: vec![ModuleRef::Inline(ModuleConfig::new("no-such-module"))],
                ..Default::default()
            },
        );
        let _handle = spawner.spawn(1, Arc::new(broken), tx).unwrap();
        assert_eq!(next(&mut rx).await, WorkerEvent::Exited { id: 1, code: Some(1) });
    }

    #[tokio::test]
    async fn kill_aborts_the_task() {
        let spawner = TaskSpawner::new(Arc::new(ModuleRegistry::with_builtins()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawner.spawn(3, config(), tx).unwrap();
        assert_eq!(next(&mut rx).await, WorkerEvent::Listening(3));
        handle.kill();
        assert_eq!(next(&mut rx).await, WorkerEvent::Exited { id: 3, code: None });
    }
}
