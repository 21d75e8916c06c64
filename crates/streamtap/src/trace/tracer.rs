//! Per-backend trace queues
//!
//! Each backend gets a bounded queue drained by its own worker task. A
//! submission runs in a child task with a timeout, so a hanging or panicking
//! backend only loses that one record. What happens to queued records at
//! shutdown is set by [`ShutdownPolicy`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{HeliconeBackend, LangfuseBackend, TraceBackend, TraceRecord};
use crate::config::{ObservabilityConfig, ShutdownPolicy};

struct BackendWorker {
    backend: Arc<dyn TraceBackend>,
    tx: mpsc::Sender<Arc<TraceRecord>>,
    handle: JoinHandle<()>,
}

/// Fans completed turns out to the configured backends
pub struct Tracer {
    workers: Mutex<Vec<BackendWorker>>,
    policy: ShutdownPolicy,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("backends", &self.backend_names())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Tracer {
    /// Start one worker per backend. Must be called inside a tokio runtime.
    pub fn new(backends: Vec<Arc<dyn TraceBackend>>, config: &ObservabilityConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let submit_timeout = Duration::from_secs(config.submit_timeout_secs);

        let workers = backends
            .into_iter()
            .map(|backend| {
                let (tx, rx) = mpsc::channel(capacity);
                let handle = tokio::spawn(run_worker(Arc::clone(&backend), rx, submit_timeout));
                BackendWorker {
                    backend,
                    tx,
                    handle,
                }
            })
            .collect();

        Self {
            workers: Mutex::new(workers),
            policy: config.shutdown,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        }
    }

    /// A tracer with no backends
    pub fn disabled() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            policy: ShutdownPolicy::Drop,
            shutdown_timeout: Duration::ZERO,
        }
    }

    /// Build the backends enabled in config. A backend whose credentials
    /// are missing is disabled with a warning.
    pub fn from_config(config: &ObservabilityConfig, client: reqwest::Client) -> Self {
        let mut backends: Vec<Arc<dyn TraceBackend>> = Vec::new();

        if config.langfuse.enabled {
            match LangfuseBackend::from_config(&config.langfuse, client.clone()) {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(e) => warn!(backend = "langfuse", error = %e, "Trace backend disabled"),
            }
        }

        if config.helicone.enabled {
            match HeliconeBackend::from_config(&config.helicone, client) {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(e) => warn!(backend = "helicone", error = %e, "Trace backend disabled"),
            }
        }

        let tracer = Self::new(backends, config);
        info!(backends = ?tracer.backend_names(), "Tracer initialized");
        tracer
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.lock().iter().map(|w| w.backend.name()).collect()
    }

    pub fn is_enabled(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Queue a record for every backend that accepts it; never waits
    pub fn dispatch(&self, record: TraceRecord) {
        let workers = self.lock();
        if workers.is_empty() {
            return;
        }

        let record = Arc::new(record);
        for worker in workers.iter() {
            let backend = worker.backend.name();
            if !worker.backend.accepts(&record) {
                debug!(
                    backend,
                    request_id = %record.request_id,
                    "Caller not in allowlist, skipping trace"
                );
                continue;
            }

            match worker.tx.try_send(Arc::clone(&record)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(
                    backend,
                    request_id = %record.request_id,
                    "Trace queue full, dropping record"
                ),
                Err(TrySendError::Closed(_)) => debug!(
                    backend,
                    request_id = %record.request_id,
                    "Trace worker stopped, dropping record"
                ),
            }
        }
    }

    /// Stop all workers according to the shutdown policy
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.lock());
        if workers.is_empty() {
            return;
        }

        match self.policy {
            ShutdownPolicy::Drop => {
                for worker in &workers {
                    worker.handle.abort();
                }
                info!(backends = workers.len(), "Tracer stopped, pending traces dropped");
            }
            ShutdownPolicy::Drain => {
                let mut handles = Vec::with_capacity(workers.len());
                for worker in workers {
                    // Closing the queue lets the worker exit once it is empty
                    drop(worker.tx);
                    handles.push(worker.handle);
                }
                let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

                let drained = tokio::time::timeout(
                    self.shutdown_timeout,
                    futures::future::join_all(handles),
                )
                .await;

                if drained.is_err() {
                    warn!(
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Trace drain timed out, aborting remaining submissions"
                    );
                    for abort in aborts {
                        abort.abort();
                    }
                } else {
                    info!("Tracer drained");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BackendWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Aborts an in-flight submission when the worker is torn down
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_worker(
    backend: Arc<dyn TraceBackend>,
    mut rx: mpsc::Receiver<Arc<TraceRecord>>,
    submit_timeout: Duration,
) {
    let name = backend.name();
    while let Some(record) = rx.recv().await {
        let request_id = record.request_id.clone();
        let backend = Arc::clone(&backend);
        let submission = tokio::spawn(async move {
            tokio::time::timeout(submit_timeout, backend.submit(&record)).await
        });
        let _guard = AbortOnDrop(submission.abort_handle());

        match submission.await {
            Ok(Ok(Ok(()))) => debug!(backend = name, %request_id, "Trace submitted"),
            Ok(Ok(Err(e))) => warn!(backend = name, %request_id, error = %e, "Trace submission failed"),
            Ok(Err(_)) => warn!(
                backend = name,
                %request_id,
                timeout_secs = submit_timeout.as_secs(),
                "Trace submission timed out"
            ),
            Err(e) => error!(backend = name, %request_id, error = %e, "Trace submission panicked"),
        }
    }
    debug!(backend = name, "Trace worker stopped");
}
