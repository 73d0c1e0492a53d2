//! Pool generations and the pointer to the current one.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::catalogue::Catalogue;
use crate::engine::EngineWorker;
use crate::error::BridgeError;
use crate::pool::{ProcessState, WorkerPool};

/// One consistent set of pools, catalogue and engine workers.
pub struct Generation {
    id: u64,
    activity_pool: Arc<dyn WorkerPool>,
    workflow_pool: Arc<dyn WorkerPool>,
    catalogue: Catalogue,
    workers: Mutex<Vec<Box<dyn EngineWorker>>>,
}

impl Generation {
    pub fn new(
        id: u64,
        activity_pool: Arc<dyn WorkerPool>,
        workflow_pool: Arc<dyn WorkerPool>,
        catalogue: Catalogue,
        workers: Vec<Box<dyn EngineWorker>>,
    ) -> Self {
        Self {
            id,
            activity_pool,
            workflow_pool,
            catalogue,
            workers: Mutex::new(workers),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn activity_pool(&self) -> Arc<dyn WorkerPool> {
        Arc::clone(&self.activity_pool)
    }

    pub fn workflow_pool(&self) -> Arc<dyn WorkerPool> {
        Arc::clone(&self.workflow_pool)
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Workflow pool processes first, then activity pool processes.
    pub fn process_states(&self) -> Vec<ProcessState> {
        let mut states = self.workflow_pool.workers();
        states.extend(self.activity_pool.workers());
        states
    }

    pub(crate) async fn start_workers(&self) -> Result<(), BridgeError> {
        let mut workers = self.workers.lock().await;
        for worker in workers.iter_mut() {
            worker.start().await?;
        }
        Ok(())
    }

    /// Stop every engine worker. Idempotent.
    pub(crate) async fn stop_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for mut worker in workers {
            tracing::debug!(generation = self.id, task_queue = worker.task_queue(), "Stopping engine worker");
            worker.stop().await;
        }
    }

    /// Stop engine workers and destroy both pools. Failures are logged.
    pub(crate) async fn destroy(&self) {
        self.stop_workers().await;
        if let Err(e) = self.workflow_pool.destroy().await {
            tracing::error!(generation = self.id, error = %e, "Failed to destroy workflow pool");
        }
        if let Err(e) = self.activity_pool.destroy().await {
            tracing::error!(generation = self.id, error = %e, "Failed to destroy activity pool");
        }
        tracing::info!(generation = self.id, "Generation destroyed");
    }
}

/// The current generation, swapped atomically under a short lock.
#[derive(Default)]
pub struct GenerationCell {
    current: RwLock<Option<Arc<Generation>>>,
}

impl GenerationCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<Generation>> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current generation, or the error a dispatch reports without one.
    pub fn current(&self) -> Result<Arc<Generation>, BridgeError> {
        self.load().ok_or(BridgeError::NoActiveGeneration)
    }

    /// Install `next` and hand back the generation it replaced.
    pub fn swap(&self, next: Arc<Generation>) -> Option<Arc<Generation>> {
        match self.current.write() {
            Ok(mut current) => current.replace(next),
            Err(poisoned) => poisoned.into_inner().replace(next),
        }
    }

    pub fn take(&self) -> Option<Arc<Generation>> {
        match self.current.write() {
            Ok(mut current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
