//! BridgeService: pool lifecycle and the reset state machine.
//!
//! This service owns:
//! - The current pool generation (both pools, catalogue, engine workers)
//! - The reset control loop (serialized, coalescing, retried with backoff)
//! - The pool event forwarder (worker crash ⇒ reset request)
//!
//! Dispatch itself lives in the activity and workflow bridges; they resolve
//! the current generation at the moment each dispatch begins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::activity::ActivityBridge;
use crate::backoff::ExponentialBackoff;
use crate::bridge::codec::Codec;
use crate::bridge::sequence::SequenceCounter;
use crate::catalogue::{Catalogue, fetch_worker_info};
use crate::config::{BridgeConfig, ConfigError};
use crate::converter::DataConverter;
use crate::engine::{ActivityContext, ActivityHandler, Engine, TaskToken, WorkflowDefinitionFactory};
use crate::error::BridgeError;
use crate::generation::{Generation, GenerationCell};
use crate::pool::{
    PoolEvent, PoolEventSender, PoolFactory, ProcessPoolFactory, ProcessState, WorkerMode,
    WorkerPool, worker_env,
};
use crate::workflow::WorkflowBridge;

/// Lifecycle of the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Stopped,
    /// Building the first generation
    Starting,
    Running,
    /// Replacing the current generation
    Resetting,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("service is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },
    #[error("failed to start: {0}")]
    Start(#[source] BridgeError),
    #[error("service is shutting down")]
    ShuttingDown,
}

type ResetWaiter = oneshot::Sender<()>;

/// Everything the control loop needs, shared with the service handle.
struct Shared {
    config: BridgeConfig,
    engine: Arc<dyn Engine>,
    pools: Arc<dyn PoolFactory>,
    codec: Arc<Codec>,
    sequence: Arc<SequenceCounter>,
    generations: Arc<GenerationCell>,
    activities: Arc<ActivityBridge>,
    workflows: Arc<WorkflowBridge>,
    state: watch::Sender<LifecycleState>,
    generation_ids: AtomicU64,
    events: StdMutex<Option<PoolEventSender>>,
    waiters: StdMutex<Vec<ResetWaiter>>,
    /// Destroy tasks of swapped-out generations; awaited by `stop`.
    retiring: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Lifecycle transition");
        }
    }

    /// Move to `to` only from one of `from`. A reset finishing after `stop`
    /// began must not report `Running`.
    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if from.contains(state) && *state != to {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(to = ?to, "Lifecycle transition");
        }
        moved
    }

    fn retire(&self, generation: Arc<Generation>) {
        let task = tokio::spawn(async move { generation.destroy().await });
        match self.retiring.lock() {
            Ok(mut retiring) => {
                retiring.retain(|t| !t.is_finished());
                retiring.push(task);
            }
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    fn take_retiring(&self) -> Vec<JoinHandle<()>> {
        match self.retiring.lock() {
            Ok(mut retiring) => std::mem::take(&mut *retiring),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn take_waiters(&self) -> Vec<ResetWaiter> {
        match self.waiters.lock() {
            Ok(mut waiters) => std::mem::take(&mut *waiters),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn event_sender(&self) -> PoolEventSender {
        let current = self.events.lock().ok().and_then(|e| e.clone());
        current.unwrap_or_else(|| {
            // No lifecycle listening: events go nowhere.
            let (tx, _rx) = mpsc::unbounded_channel();
            tx
        })
    }

    /// Create both pools, discover the catalogue and register it. The
    /// returned generation's engine workers are not started yet.
    async fn build_generation(&self) -> Result<Arc<Generation>, BridgeError> {
        let id = self.generation_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let format = self.codec.format();
        let events = self.event_sender();

        let activity_config = &self.config.activities;
        let activity_pool = self
            .pools
            .create(
                WorkerMode::Activities,
                activity_config,
                worker_env(WorkerMode::Activities, format, &activity_config.env),
                events.clone(),
            )
            .await?;

        let workflow_config = self.config.workflow_pool();
        let workflow_pool = match self
            .pools
            .create(
                WorkerMode::Workflow,
                &workflow_config,
                worker_env(WorkerMode::Workflow, format, &workflow_config.env),
                events,
            )
            .await
        {
            Ok(pool) => pool,
            Err(e) => {
                destroy_pool(&activity_pool, id).await;
                return Err(e.into());
            }
        };

        match self
            .assemble(id, Arc::clone(&activity_pool), Arc::clone(&workflow_pool))
            .await
        {
            Ok(generation) => Ok(Arc::new(generation)),
            Err(e) => {
                destroy_pool(&workflow_pool, id).await;
                destroy_pool(&activity_pool, id).await;
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        id: u64,
        activity_pool: Arc<dyn WorkerPool>,
        workflow_pool: Arc<dyn WorkerPool>,
    ) -> Result<Generation, BridgeError> {
        let version = &self.config.version;
        let workflow_infos =
            fetch_worker_info(&self.codec, workflow_pool.as_ref(), &self.sequence, version).await?;
        let activity_infos =
            fetch_worker_info(&self.codec, activity_pool.as_ref(), &self.sequence, version).await?;
        let catalogue = Catalogue::merge(workflow_infos, activity_infos);

        let activities: Arc<dyn ActivityHandler> = self.activities.clone();
        let workflows: Arc<dyn WorkflowDefinitionFactory> = self.workflows.clone();
        let workers = catalogue.register(
            self.engine.as_ref(),
            activities,
            workflows,
            self.config.graceful_timeout,
        )?;

        tracing::info!(
            generation = id,
            activities = ?catalogue.activity_names(),
            workflows = ?catalogue.workflow_names(),
            "Catalogue registered"
        );
        Ok(Generation::new(
            id,
            activity_pool,
            workflow_pool,
            catalogue,
            workers,
        ))
    }

    /// One reset attempt: stop engine workers, purge the sticky cache, build
    /// and start a new generation, swap it in, retire the old one.
    async fn reset_once(&self) -> Result<(), BridgeError> {
        self.transition(
            &[LifecycleState::Running, LifecycleState::Resetting],
            LifecycleState::Resetting,
        );

        if let Some(current) = self.generations.load() {
            current.stop_workers().await;
        }
        self.engine.purge_sticky_cache();

        let next = self.build_generation().await?;
        if let Err(e) = next.start_workers().await {
            next.destroy().await;
            return Err(e);
        }

        let previous = self.generations.swap(Arc::clone(&next));
        tracing::info!(generation = next.id(), "Worker pools replaced");
        self.transition(&[LifecycleState::Resetting], LifecycleState::Running);

        if let Some(previous) = previous {
            self.retire(previous);
        }
        Ok(())
    }

    /// Retry [`Self::reset_once`] with backoff until it succeeds or shutdown
    /// is signalled.
    async fn reset_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), LifecycleError> {
        let mut backoff = ExponentialBackoff::new(self.config.reset_backoff.clone());
        loop {
            if *shutdown.borrow() {
                return Err(LifecycleError::ShuttingDown);
            }

            match self.reset_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let wait = backoff.next_interval();
                    tracing::error!(
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in = ?wait,
                        "Reset failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => return Err(LifecycleError::ShuttingDown),
                    }
                }
            }
        }
    }
}

async fn destroy_pool(pool: &Arc<dyn WorkerPool>, generation: u64) {
    if let Err(e) = pool.destroy().await {
        tracing::error!(generation, error = %e, "Failed to destroy pool");
    }
}

/// Consumes reset requests one at a time. Requests that arrive while a reset
/// runs collapse into a single follow-up reset.
async fn run_control_loop(
    shared: Arc<Shared>,
    mut requests: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
            }
        }

        let waiters = shared.take_waiters();
        tracing::info!(waiters = waiters.len(), "Reset requested");
        match shared.reset_with_retry(&mut shutdown).await {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            Err(_) => break,
        }
    }
    tracing::debug!("Reset control loop exited");
}

/// Turns pool failure events into reset requests without waiting.
async fn forward_pool_events(
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    requests: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            PoolEvent::WorkerError {
                mode,
                worker,
                error,
            } => tracing::warn!(%mode, %worker, %error, "Worker failed, resetting pools"),
            PoolEvent::PoolError { mode, error } => {
                tracing::warn!(%mode, %error, "Pool failed, resetting pools")
            }
        }
        if requests.try_send(()).is_err() {
            tracing::debug!("Reset already pending");
        }
    }
}

struct Control {
    requests: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Lifecycle owner of the bridge.
///
/// `start` builds the first generation; `reset` (or a pool failure) replaces
/// it wholesale; `stop` tears everything down.
pub struct BridgeService {
    shared: Arc<Shared>,
    control: StdMutex<Option<Control>>,
    /// Serializes start and stop.
    transitions: Mutex<()>,
}

impl BridgeService {
    pub fn new(
        config: BridgeConfig,
        engine: Arc<dyn Engine>,
        pools: Arc<dyn PoolFactory>,
        converter: Arc<dyn DataConverter>,
    ) -> Self {
        let codec = Arc::new(Codec::new(config.wire_format, converter));
        let sequence = Arc::new(SequenceCounter::new());
        let generations = Arc::new(GenerationCell::new());
        let activities = Arc::new(ActivityBridge::new(
            Arc::clone(&codec),
            Arc::clone(&generations),
            Arc::clone(&sequence),
        ));
        let workflows = Arc::new(WorkflowBridge::new(
            Arc::clone(&codec),
            Arc::clone(&generations),
            Arc::clone(&sequence),
        ));
        let (state, _) = watch::channel(LifecycleState::Stopped);

        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                pools,
                codec,
                sequence,
                generations,
                activities,
                workflows,
                state,
                generation_ids: AtomicU64::new(0),
                events: StdMutex::new(None),
                waiters: StdMutex::new(Vec::new()),
                retiring: StdMutex::new(Vec::new()),
            }),
            control: StdMutex::new(None),
            transitions: Mutex::new(()),
        }
    }

    /// Service backed by real worker processes.
    pub fn with_process_pools(
        config: BridgeConfig,
        engine: Arc<dyn Engine>,
        converter: Arc<dyn DataConverter>,
    ) -> Self {
        Self::new(
            config,
            engine,
            Arc::new(ProcessPoolFactory::default()),
            converter,
        )
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _transition = self.transitions.lock().await;
        self.shared.config.validate()?;
        self.expect_state(LifecycleState::Stopped)?;
        self.shared.set_state(LifecycleState::Starting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Ok(mut events) = self.shared.events.lock() {
            *events = Some(events_tx);
        }

        let generation = match self.shared.build_generation().await {
            Ok(generation) => generation,
            Err(e) => return Err(self.abort_start(e)),
        };
        if let Err(e) = generation.start_workers().await {
            generation.destroy().await;
            return Err(self.abort_start(e));
        }
        self.shared.generations.swap(Arc::clone(&generation));

        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(run_control_loop(
                Arc::clone(&self.shared),
                requests_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(forward_pool_events(
                events_rx,
                requests_tx.clone(),
                shutdown_rx,
            )),
        ];
        if let Ok(mut control) = self.control.lock() {
            *control = Some(Control {
                requests: requests_tx,
                shutdown: shutdown_tx,
                tasks,
            });
        }

        self.shared.set_state(LifecycleState::Running);
        tracing::info!(
            generation = generation.id(),
            format = self.shared.codec.format().name(),
            "Bridge started"
        );
        Ok(())
    }

    fn abort_start(&self, error: BridgeError) -> LifecycleError {
        tracing::error!(error = %error, "Bridge failed to start");
        if let Ok(mut events) = self.shared.events.lock() {
            *events = None;
        }
        self.shared.set_state(LifecycleState::Stopped);
        LifecycleError::Start(error)
    }

    fn expect_state(&self, expected: LifecycleState) -> Result<(), LifecycleError> {
        let actual = self.state();
        if actual != expected {
            return Err(LifecycleError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// Replace both pools and wait until a reset that began after this call
    /// has completed. Concurrent calls share one reset.
    pub async fn reset(&self) -> Result<(), LifecycleError> {
        let requests = self
            .control
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.requests.clone()));
        let Some(requests) = requests else {
            return Err(LifecycleError::InvalidState {
                expected: LifecycleState::Running,
                actual: self.state(),
            });
        };

        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.shared.waiters.lock() {
            waiters.push(tx);
        }
        // A full channel means a reset is already queued; it will take our
        // waiter when it begins.
        let _ = requests.try_send(());

        rx.await.map_err(|_| LifecycleError::ShuttingDown)
    }

    /// Stop the control loop, engine workers and pools. Safe to call in any
    /// state, including after a failed start.
    pub async fn stop(&self) {
        let _transition = self.transitions.lock().await;
        if self.state() == LifecycleState::Stopped {
            return;
        }
        self.shared.set_state(LifecycleState::Stopping);

        let control = self.control.lock().ok().and_then(|mut c| c.take());
        if let Some(control) = control {
            let _ = control.shutdown.send(true);
            drop(control.requests);
            for task in control.tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Lifecycle task ended abnormally");
                }
            }
        }
        // Pending reset callers observe ShuttingDown.
        drop(self.shared.take_waiters());
        if let Ok(mut events) = self.shared.events.lock() {
            *events = None;
        }

        for task in self.shared.take_retiring() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Generation destroy ended abnormally");
            }
        }
        if let Some(generation) = self.shared.generations.take() {
            generation.destroy().await;
        }
        self.shared.set_state(LifecycleState::Stopped);
        tracing::info!("Bridge stopped");
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// Processes of the current generation, workflow pool first.
    pub fn workers(&self) -> Vec<ProcessState> {
        self.shared
            .generations
            .load()
            .map(|g| g.process_states())
            .unwrap_or_default()
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.shared
            .generations
            .load()
            .map(|g| g.catalogue().activity_names())
            .unwrap_or_default()
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.shared
            .generations
            .load()
            .map(|g| g.catalogue().workflow_names())
            .unwrap_or_default()
    }

    /// Context of an in-flight activity, for heartbeat and cancellation.
    pub fn activity_context(&self, token: &TaskToken) -> Result<ActivityContext, BridgeError> {
        self.shared.activities.activity_context(token)
    }

    pub fn activities(&self) -> Arc<ActivityBridge> {
        Arc::clone(&self.shared.activities)
    }

    pub fn workflows(&self) -> Arc<WorkflowBridge> {
        Arc::clone(&self.shared.workflows)
    }

    /// Id of the current generation, 0 before the first start.
    pub fn generation(&self) -> u64 {
        self.shared
            .generations
            .load()
            .map(|g| g.id())
            .unwrap_or_default()
    }
}
