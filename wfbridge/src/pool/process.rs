//! Pool of long-lived child processes speaking framed exchanges on stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{
    PoolError, PoolEvent, PoolEventSender, PoolFactory, ProcessState, WorkerId, WorkerMode,
    WorkerPool, WorkerStatus,
};
use crate::bridge::codec::ExchangeCodec;
use crate::bridge::protocol::Exchange;
use crate::config::PoolConfig;

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &PoolConfig, env: &HashMap<String, String>)
    -> Result<Child, SpawnError>;
}

/// Runs the configured command with piped stdio and inherited stderr.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(
        &self,
        config: &PoolConfig,
        env: &HashMap<String, String>,
    ) -> Result<Child, SpawnError> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| SpawnError::Other("empty worker command".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

struct ProcessWorker {
    id: WorkerId,
    child: Child,
    writer: FramedWrite<ChildStdin, ExchangeCodec>,
    reader: FramedRead<ChildStdout, ExchangeCodec>,
}

impl ProcessWorker {
    fn attach(mut child: Child) -> Result<Self, PoolError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("stdout not captured".to_string()))?;
        Ok(Self {
            id: WorkerId::new(),
            child,
            writer: FramedWrite::new(stdin, ExchangeCodec::new()),
            reader: FramedRead::new(stdout, ExchangeCodec::new()),
        })
    }

    async fn roundtrip(&mut self, exchange: Exchange) -> Result<Exchange, PoolError> {
        self.writer
            .send(exchange)
            .await
            .map_err(|e| PoolError::Io(e.to_string()))?;
        match self.reader.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(PoolError::Io(e.to_string())),
            None => Err(PoolError::WorkerCrashed(self.id)),
        }
    }

    /// Close stdin, ask politely, then kill.
    async fn stop(mut self) {
        let id = self.id;
        drop(self.writer);
        drop(self.reader);

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(worker = %id, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(worker = %id, %status, "Worker exited"),
            Ok(Err(e)) => tracing::warn!(worker = %id, error = %e, "Failed to reap worker"),
            Err(_) => {
                tracing::warn!(worker = %id, "Worker ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(worker = %id, error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

/// Decrements the in-flight counter on drop and wakes a pending destroy.
struct InFlight<'a> {
    count: &'a AtomicUsize,
    idle: &'a Notify,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, idle: &'a Notify) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self { count, idle }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A worker checked out for one exchange. Dropped without [`Checkout::release`]
/// (the exchange future was cancelled mid-flight) the worker is retired, since
/// its pipes may hold half an exchange.
struct Checkout<'a> {
    pool: &'a ProcessPool,
    worker: Option<ProcessWorker>,
}

impl<'a> Checkout<'a> {
    fn new(pool: &'a ProcessPool, worker: ProcessWorker) -> Self {
        pool.set_status(worker.id, WorkerStatus::Working, false);
        Self {
            pool,
            worker: Some(worker),
        }
    }

    async fn roundtrip(&mut self, exchange: Exchange) -> Result<Exchange, PoolError> {
        match self.worker.as_mut() {
            Some(worker) => worker.roundtrip(exchange).await,
            None => Err(PoolError::Destroyed),
        }
    }

    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.set_status(worker.id, WorkerStatus::Ready, true);
            self.pool.release(worker);
        }
    }

    fn retire(mut self, error: &PoolError) {
        if let Some(worker) = self.worker.take() {
            self.pool.retire(worker, error);
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let error = PoolError::Abandoned(worker.id);
            self.pool.retire(worker, &error);
        }
    }
}

/// Stop a worker in the background. Outside a runtime the child is killed
/// on drop instead.
fn stop_detached(worker: ProcessWorker) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(worker.stop());
        }
        Err(_) => drop(worker),
    }
}

#[cfg(unix)]
fn signal_pids(pids: &[u32], signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    for &pid in pids {
        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
            tracing::debug!(pid, ?signal, error = %e, "Signal failed");
        }
    }
}

/// Worker processes handed out one exchange at a time.
///
/// A worker that fails an exchange is removed from the pool for good and a
/// [`PoolEvent::WorkerError`] is emitted; replacing it is the lifecycle's job.
pub struct ProcessPool {
    mode: WorkerMode,
    config: PoolConfig,
    available_rx: Mutex<mpsc::Receiver<ProcessWorker>>,
    available_tx: mpsc::Sender<ProcessWorker>,
    live: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
    destroyed: AtomicBool,
    /// Cancelled on destroy; wakes exchanges still waiting for a worker.
    closing: CancellationToken,
    states: StdMutex<HashMap<WorkerId, ProcessState>>,
    events: PoolEventSender,
}

impl ProcessPool {
    /// Spawn every worker up front. Any spawn failure aborts the pool.
    pub fn start(
        mode: WorkerMode,
        config: &PoolConfig,
        env: &HashMap<String, String>,
        spawner: &dyn WorkerSpawner,
        events: PoolEventSender,
    ) -> Result<Self, PoolError> {
        let num_workers = config.num_workers.max(1);
        let (tx, rx) = mpsc::channel(num_workers);
        let mut states = HashMap::with_capacity(num_workers);

        for _ in 0..num_workers {
            let child = spawner
                .spawn(config, env)
                .map_err(|e| PoolError::Spawn(format!("spawner failed: {}", e)))?;
            let worker = ProcessWorker::attach(child)?;
            let pid = worker.child.id().unwrap_or_default();
            tracing::debug!(%mode, worker = %worker.id, pid, "Worker spawned");
            states.insert(
                worker.id,
                ProcessState {
                    id: worker.id,
                    pid,
                    mode,
                    status: WorkerStatus::Ready,
                    num_execs: 0,
                    created_at: chrono::Utc::now(),
                },
            );
            tx.try_send(worker)
                .map_err(|e| PoolError::Spawn(format!("failed to enqueue worker: {}", e)))?;
        }

        tracing::info!(%mode, num_workers, "Worker pool started");
        Ok(Self {
            mode,
            config: config.clone(),
            available_rx: Mutex::new(rx),
            available_tx: tx,
            live: AtomicUsize::new(num_workers),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            destroyed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            states: StdMutex::new(states),
            events,
        })
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    fn set_status(&self, id: WorkerId, status: WorkerStatus, executed: bool) {
        if let Ok(mut states) = self.states.lock()
            && let Some(state) = states.get_mut(&id)
        {
            state.status = status;
            if executed {
                state.num_execs += 1;
            }
        }
    }

    async fn acquire(&self) -> Result<ProcessWorker, PoolError> {
        if self.live.load(Ordering::Acquire) == 0 {
            return Err(PoolError::NoWorkers);
        }
        let timeout = self.config.allocate_timeout;
        let wait = async {
            let mut rx = self.available_rx.lock().await;
            rx.recv().await
        };
        tokio::select! {
            _ = self.closing.cancelled() => Err(PoolError::Destroyed),
            worker = tokio::time::timeout(timeout, wait) => worker
                .map_err(|_| PoolError::AllocateTimeout(timeout))?
                .ok_or(PoolError::NoWorkers),
        }
    }

    fn release(&self, worker: ProcessWorker) {
        if self.destroyed.load(Ordering::Acquire) {
            self.set_status(worker.id, WorkerStatus::Stopped, false);
            stop_detached(worker);
            return;
        }
        if let Err(e) = self.available_tx.try_send(worker) {
            tracing::error!(mode = %self.mode, error = %e, "Failed to return worker to pool");
        }
    }

    fn retire(&self, worker: ProcessWorker, error: &PoolError) {
        let id = worker.id;
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        // Failures during teardown must not reset the next generation.
        if self.destroyed.load(Ordering::Acquire) {
            self.set_status(id, WorkerStatus::Stopped, false);
            tracing::debug!(mode = %self.mode, worker = %id, error = %error, "Worker ended during destroy");
        } else {
            self.set_status(id, WorkerStatus::Errored, false);
            tracing::error!(mode = %self.mode, worker = %id, error = %error, "Worker failed");
            let _ = self.events.send(PoolEvent::WorkerError {
                mode: self.mode,
                worker: id,
                error: error.to_string(),
            });
        }
        stop_detached(worker);
    }

    /// Pids of workers currently inside an exchange. Their children are not
    /// reaped until the exchange ends, so the pids cannot be reused.
    fn busy_pids(&self) -> Vec<u32> {
        self.states
            .lock()
            .map(|states| {
                states
                    .values()
                    .filter(|s| s.status == WorkerStatus::Working && s.pid != 0)
                    .map(|s| s.pid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Terminate workers stuck in an exchange: SIGTERM, then SIGKILL after
    /// the grace period. Their exchanges then fail and retire them.
    async fn terminate_busy(&self) {
        let pids = self.busy_pids();
        if pids.is_empty() {
            return;
        }
        tracing::warn!(mode = %self.mode, ?pids, "Terminating workers still in an exchange");

        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            signal_pids(&pids, Signal::SIGTERM);
            if self.wait_idle(STOP_GRACE).await {
                return;
            }
            tracing::warn!(mode = %self.mode, ?pids, "Workers ignored SIGTERM, killing");
            signal_pids(&pids, Signal::SIGKILL);
            if !self.wait_idle(STOP_GRACE).await {
                tracing::error!(mode = %self.mode, "Exchanges still in flight after kill");
            }
        }
    }

    async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    async fn exec(&self, exchange: Exchange) -> Result<Exchange, PoolError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PoolError::Destroyed);
        }
        let _in_flight = InFlight::enter(&self.in_flight, &self.idle);

        let mut checkout = Checkout::new(self, self.acquire().await?);
        match checkout.roundtrip(exchange).await {
            Ok(reply) => {
                checkout.release();
                Ok(reply)
            }
            Err(e) => {
                checkout.retire(&e);
                Err(e)
            }
        }
    }

    fn workers(&self) -> Vec<ProcessState> {
        self.states
            .lock()
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn destroy(&self) -> Result<(), PoolError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.cancel();

        if !self.wait_idle(self.config.destroy_timeout).await {
            tracing::warn!(
                mode = %self.mode,
                in_flight = self.in_flight.load(Ordering::Acquire),
                "Destroy timeout elapsed with exchanges still in flight"
            );
            self.terminate_busy().await;
        }

        let mut idle_workers = Vec::new();
        {
            let mut rx = self.available_rx.lock().await;
            while let Ok(worker) = rx.try_recv() {
                idle_workers.push(worker);
            }
        }

        for worker in idle_workers {
            self.set_status(worker.id, WorkerStatus::Stopped, false);
            worker.stop().await;
        }
        self.live.store(0, Ordering::Release);
        tracing::info!(mode = %self.mode, "Worker pool destroyed");
        Ok(())
    }
}

/// Builds [`ProcessPool`]s with a configurable spawner.
pub struct ProcessPoolFactory {
    spawner: Arc<dyn WorkerSpawner>,
}

impl ProcessPoolFactory {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self { spawner }
    }
}

impl Default for ProcessPoolFactory {
    fn default() -> Self {
        Self::new(Arc::new(CommandSpawner))
    }
}

#[async_trait]
impl PoolFactory for ProcessPoolFactory {
    async fn create(
        &self,
        mode: WorkerMode,
        config: &PoolConfig,
        env: HashMap<String, String>,
        events: PoolEventSender,
    ) -> Result<Arc<dyn WorkerPool>, PoolError> {
        let pool = ProcessPool::start(mode, config, &env, self.spawner.as_ref(), events)?;
        Ok(Arc::new(pool))
    }
}
