//! Fakes shared by unit tests: scripted pools, a recording engine and a
//! recording workflow environment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};

use crate::bridge::codec::WireFormat;
use crate::bridge::protocol::{Context, Exchange, Frame};
use crate::config::PoolConfig;
use crate::converter::{DataConverter, JsonDataConverter, Payloads};
use crate::engine::{
    ActivityContext, ActivityHandler, ActivityOutcome, ActivityParams, ApplicationError,
    ChildWorkflowParams, Engine, EngineError, EngineWorker, ExternalSignalParams, ResultCallback,
    ScheduledHandle, WorkerOptions, WorkflowDefinition, WorkflowDefinitionFactory,
    WorkflowEnvironment, WorkflowExecutionInfo,
};
use crate::error::BridgeError;
use crate::pool::{
    PoolError, PoolEvent, PoolEventSender, PoolFactory, ProcessState, WorkerId, WorkerMode,
    WorkerPool, WorkerStatus,
};

static NEXT_PID: AtomicU32 = AtomicU32::new(1000);

/// Holds an exchange inside the pool until the test lets it go.
pub(crate) struct Gate {
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    /// Wait until an exchange is parked at the gate.
    pub(crate) async fn entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    pub(crate) fn open(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.add_permits(1);
        self.release.acquire().await.unwrap().forget();
    }
}

type Script = Box<dyn Fn(&Context, Vec<Frame>) -> Vec<Frame> + Send + Sync>;

/// In-memory pool that decodes each exchange and answers via a closure.
pub(crate) struct ScriptedPool {
    format: WireFormat,
    script: Script,
    mode: WorkerMode,
    worker_id: WorkerId,
    pid: u32,
    created_at: DateTime<Utc>,
    gate: StdMutex<Option<Arc<Gate>>>,
    contexts: StdMutex<Vec<Context>>,
    frame_ids: StdMutex<Vec<u64>>,
    commands: StdMutex<Vec<String>>,
    execs: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
    closing: AtomicBool,
    destroyed: AtomicBool,
}

impl ScriptedPool {
    pub(crate) fn new<F>(format: WireFormat, script: F) -> Self
    where
        F: Fn(&Context, Vec<Frame>) -> Vec<Frame> + Send + Sync + 'static,
    {
        Self {
            format,
            script: Box::new(script),
            mode: WorkerMode::Activities,
            worker_id: WorkerId::new(),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            gate: StdMutex::new(None),
            contexts: StdMutex::new(Vec::new()),
            frame_ids: StdMutex::new(Vec::new()),
            commands: StdMutex::new(Vec::new()),
            execs: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_gate(self, gate: Arc<Gate>) -> Self {
        self.set_gate(Some(gate));
        self
    }

    pub(crate) fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn set_gate(&self, gate: Option<Arc<Gate>>) {
        *self.gate.lock().unwrap() = gate;
    }

    pub(crate) fn contexts(&self) -> Vec<Context> {
        self.contexts.lock().unwrap().clone()
    }

    pub(crate) fn frame_ids(&self) -> Vec<u64> {
        self.frame_ids.lock().unwrap().clone()
    }

    /// Names of every command frame received, in arrival order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn exec_count(&self) -> u64 {
        self.execs.load(Ordering::SeqCst)
    }

    /// True once `destroy` has drained every in-flight exchange.
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn answer(&self, exchange: Exchange) -> Result<Exchange, PoolError> {
        let ctx: Context =
            serde_json::from_slice(&exchange.context).map_err(|e| PoolError::Io(e.to_string()))?;
        let frames = self
            .format
            .decode_frames(&exchange.body)
            .map_err(|e| PoolError::Io(e.to_string()))?;

        self.contexts.lock().unwrap().push(ctx.clone());
        self.frame_ids
            .lock()
            .unwrap()
            .extend(frames.iter().map(|f| f.id));
        self.commands.lock().unwrap().extend(
            frames
                .iter()
                .filter(|f| !f.command.is_empty())
                .map(|f| f.command.clone()),
        );

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let out = (self.script)(&ctx, frames);
        self.execs.fetch_add(1, Ordering::SeqCst);
        let body = self
            .format
            .encode_frames(&out)
            .map_err(|e| PoolError::Io(e.to_string()))?;
        Ok(Exchange::new(exchange.context.clone(), body))
    }
}

#[async_trait]
impl WorkerPool for ScriptedPool {
    async fn exec(&self, exchange: Exchange) -> Result<Exchange, PoolError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PoolError::Destroyed);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.answer(exchange).await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        result
    }

    fn workers(&self) -> Vec<ProcessState> {
        vec![ProcessState {
            id: self.worker_id,
            pid: self.pid,
            mode: self.mode,
            status: if self.is_destroyed() {
                WorkerStatus::Stopped
            } else {
                WorkerStatus::Ready
            },
            num_execs: self.exec_count(),
            created_at: self.created_at,
        }]
    }

    async fn destroy(&self) -> Result<(), PoolError> {
        self.closing.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Result frame whose payloads are the given worker-info documents.
pub(crate) fn worker_info_frame(id: u64, infos: &[Value]) -> Frame {
    Frame {
        id,
        payloads: JsonDataConverter.to_payloads(infos).unwrap(),
        ..Frame::default()
    }
}

/// A worker that advertises a small catalogue and answers activities with
/// its generation tag, e.g. `"g2"`.
pub(crate) fn catalogue_worker(mode: WorkerMode, generation: usize) -> ScriptedPool {
    ScriptedPool::new(WireFormat::Json, move |_, frames| {
        frames
            .into_iter()
            .map(|f| match f.command.as_str() {
                "GetWorkerInfo" => {
                    let info = match mode {
                        WorkerMode::Workflow => json!({
                            "TaskQueue": "default",
                            "Workflows": [{"Name": "Greeting"}]
                        }),
                        WorkerMode::Activities => json!({
                            "TaskQueue": "default",
                            "Activities": [{"Name": "A.foo"}, {"Name": "A.bar"}]
                        }),
                    };
                    worker_info_frame(f.id, &[info])
                }
                "InvokeActivity" => Frame {
                    id: f.id,
                    payloads: JsonDataConverter
                        .to_payloads(&[json!(format!("g{generation}"))])
                        .unwrap(),
                    ..Frame::default()
                },
                _ => Frame {
                    id: f.id,
                    ..Frame::default()
                },
            })
            .collect()
    })
    .with_mode(mode)
}

type MakePool = Box<dyn Fn(WorkerMode, usize) -> ScriptedPool + Send + Sync>;

/// Hands out scripted pools, numbering generations per mode from 1.
pub(crate) struct FakePoolFactory {
    make: MakePool,
    created: StdMutex<Vec<(WorkerMode, Arc<ScriptedPool>)>>,
    envs: StdMutex<Vec<HashMap<String, String>>>,
    configs: StdMutex<Vec<(WorkerMode, PoolConfig)>>,
    failures: AtomicUsize,
    events: StdMutex<Option<PoolEventSender>>,
}

impl FakePoolFactory {
    pub(crate) fn new<F>(make: F) -> Self
    where
        F: Fn(WorkerMode, usize) -> ScriptedPool + Send + Sync + 'static,
    {
        Self {
            make: Box::new(make),
            created: StdMutex::new(Vec::new()),
            envs: StdMutex::new(Vec::new()),
            configs: StdMutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            events: StdMutex::new(None),
        }
    }

    /// Factory whose pools are [`catalogue_worker`]s.
    pub(crate) fn with_catalogue() -> Self {
        Self::new(catalogue_worker)
    }

    /// Fail the next `n` pool creations.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn created(&self, mode: WorkerMode) -> Vec<Arc<ScriptedPool>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == mode)
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    pub(crate) fn creations(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub(crate) fn envs(&self) -> Vec<HashMap<String, String>> {
        self.envs.lock().unwrap().clone()
    }

    pub(crate) fn configs(&self) -> Vec<(WorkerMode, PoolConfig)> {
        self.configs.lock().unwrap().clone()
    }

    /// Emit a pool event through the sender of the latest pool.
    pub(crate) fn emit(&self, event: PoolEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl PoolFactory for FakePoolFactory {
    async fn create(
        &self,
        mode: WorkerMode,
        config: &PoolConfig,
        env: HashMap<String, String>,
        events: PoolEventSender,
    ) -> Result<Arc<dyn WorkerPool>, PoolError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PoolError::Spawn("scripted spawn failure".to_string()));
        }

        self.envs.lock().unwrap().push(env);
        self.configs.lock().unwrap().push((mode, config.clone()));
        *self.events.lock().unwrap() = Some(events);

        let mut created = self.created.lock().unwrap();
        let generation = created.iter().filter(|(m, _)| *m == mode).count() + 1;
        let scripted = Arc::new((self.make)(mode, generation).with_mode(mode));
        created.push((mode, Arc::clone(&scripted)));
        let pool: Arc<dyn WorkerPool> = scripted;
        Ok(pool)
    }
}

/// What one engine worker was asked to do.
#[derive(Default)]
pub(crate) struct WorkerRecord {
    pub task_queue: String,
    pub options: WorkerOptions,
    pub activities: Vec<String>,
    pub workflows: Vec<String>,
    pub started: bool,
    pub stopped: bool,
    pub handlers: HashMap<String, Arc<dyn ActivityHandler>>,
    pub factories: HashMap<String, Arc<dyn WorkflowDefinitionFactory>>,
}

pub(crate) struct FakeEngineWorker {
    task_queue: String,
    record: Arc<StdMutex<WorkerRecord>>,
    fail_start: Arc<AtomicBool>,
}

#[async_trait]
impl EngineWorker for FakeEngineWorker {
    fn task_queue(&self) -> &str {
        &self.task_queue
    }

    fn register_activity(
        &mut self,
        name: &str,
        handler: Arc<dyn ActivityHandler>,
    ) -> Result<(), EngineError> {
        let mut record = self.record.lock().unwrap();
        record.activities.push(name.to_string());
        record.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    fn register_workflow(
        &mut self,
        name: &str,
        factory: Arc<dyn WorkflowDefinitionFactory>,
    ) -> Result<(), EngineError> {
        let mut record = self.record.lock().unwrap();
        record.workflows.push(name.to_string());
        record.factories.insert(name.to_string(), factory);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("scripted start failure".to_string()));
        }
        self.record.lock().unwrap().started = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.record.lock().unwrap().stopped = true;
    }
}

/// Engine that records every worker it creates.
pub(crate) struct FakeEngine {
    records: StdMutex<Vec<Arc<StdMutex<WorkerRecord>>>>,
    purges: AtomicUsize,
    fail_new_worker: AtomicBool,
    fail_start: Arc<AtomicBool>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self {
            records: StdMutex::new(Vec::new()),
            purges: AtomicUsize::new(0),
            fail_new_worker: AtomicBool::new(false),
            fail_start: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn fail_new_worker(&self, fail: bool) {
        self.fail_new_worker.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn records(&self) -> Vec<Arc<StdMutex<WorkerRecord>>> {
        self.records.lock().unwrap().clone()
    }

    pub(crate) fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// Workers started and not yet stopped.
    pub(crate) fn live_workers(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| {
                let r = r.lock().unwrap();
                r.started && !r.stopped
            })
            .count()
    }

    /// Handler the engine would call for `name`, from the newest worker.
    pub(crate) fn activity_handler(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.records()
            .iter()
            .rev()
            .find_map(|r| r.lock().unwrap().handlers.get(name).cloned())
    }
}

impl Engine for FakeEngine {
    fn new_worker(
        &self,
        task_queue: &str,
        options: WorkerOptions,
    ) -> Result<Box<dyn EngineWorker>, EngineError> {
        if self.fail_new_worker.load(Ordering::SeqCst) {
            return Err(EngineError::CreateWorker {
                task_queue: task_queue.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let record = Arc::new(StdMutex::new(WorkerRecord {
            task_queue: task_queue.to_string(),
            options,
            ..WorkerRecord::default()
        }));
        self.records.lock().unwrap().push(Arc::clone(&record));
        Ok(Box::new(FakeEngineWorker {
            task_queue: task_queue.to_string(),
            record,
            fail_start: Arc::clone(&self.fail_start),
        }))
    }

    fn purge_sticky_cache(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
    }
}

struct NoopActivity;

#[async_trait]
impl ActivityHandler for NoopActivity {
    async fn execute(
        &self,
        _ctx: ActivityContext,
        args: Payloads,
    ) -> Result<ActivityOutcome, BridgeError> {
        Ok(ActivityOutcome::Completed(args))
    }
}

struct NoopWorkflow;

#[async_trait]
impl WorkflowDefinition for NoopWorkflow {
    async fn execute(
        &mut self,
        _env: Arc<dyn WorkflowEnvironment>,
        _input: Payloads,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_workflow_task_started(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn handle_signal(&mut self, _name: &str, _input: Payloads) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn handle_query(&mut self, _name: &str, _args: Payloads) -> Result<Payloads, BridgeError> {
        Ok(Payloads::default())
    }

    fn stack_trace(&self) -> String {
        String::new()
    }

    async fn close(&mut self) {}
}

struct NoopWorkflowFactory;

impl WorkflowDefinitionFactory for NoopWorkflowFactory {
    fn new_definition(&self) -> Box<dyn WorkflowDefinition> {
        Box::new(NoopWorkflow)
    }
}

pub(crate) fn noop_activity_handler() -> Arc<dyn ActivityHandler> {
    Arc::new(NoopActivity)
}

pub(crate) fn noop_workflow_factory() -> Arc<dyn WorkflowDefinitionFactory> {
    Arc::new(NoopWorkflowFactory)
}

/// Workflow environment that records scheduling calls and parks callbacks
/// until the test resolves them.
pub(crate) struct FakeWorkflowEnv {
    info: WorkflowExecutionInfo,
    replaying: AtomicBool,
    next_handle: AtomicU64,
    pub activities: StdMutex<Vec<ActivityParams>>,
    pub timers: StdMutex<Vec<Duration>>,
    pub children: StdMutex<Vec<ChildWorkflowParams>>,
    pub signals: StdMutex<Vec<ExternalSignalParams>>,
    pub cancelled: StdMutex<Vec<ScheduledHandle>>,
    pub completed: StdMutex<Option<Result<Payloads, ApplicationError>>>,
    pending: StdMutex<Vec<ResultCallback>>,
}

impl FakeWorkflowEnv {
    pub(crate) fn new(workflow_type: &str) -> Arc<Self> {
        Arc::new(Self {
            info: WorkflowExecutionInfo {
                workflow_type: workflow_type.to_string(),
                workflow_id: "wf-1".to_string(),
                run_id: "run-1".to_string(),
                task_queue: "default".to_string(),
                namespace: "default".to_string(),
            },
            replaying: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            activities: StdMutex::new(Vec::new()),
            timers: StdMutex::new(Vec::new()),
            children: StdMutex::new(Vec::new()),
            signals: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            completed: StdMutex::new(None),
            pending: StdMutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::SeqCst);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Resolve the oldest parked callback.
    pub(crate) fn resolve_next(&self, result: Result<Payloads, ApplicationError>) {
        let callback = self.pending.lock().unwrap().remove(0);
        callback(result);
    }

    fn park(&self, callback: ResultCallback) -> u64 {
        self.pending.lock().unwrap().push(callback);
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl WorkflowEnvironment for FakeWorkflowEnv {
    fn workflow_info(&self) -> WorkflowExecutionInfo {
        self.info.clone()
    }

    fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn history_length(&self) -> i64 {
        7
    }

    fn execute_activity(&self, params: ActivityParams, callback: ResultCallback) -> ScheduledHandle {
        self.activities.lock().unwrap().push(params);
        ScheduledHandle::Activity(self.park(callback))
    }

    fn new_timer(&self, duration: Duration, callback: ResultCallback) -> ScheduledHandle {
        self.timers.lock().unwrap().push(duration);
        ScheduledHandle::Timer(self.park(callback))
    }

    fn execute_child_workflow(
        &self,
        params: ChildWorkflowParams,
        callback: ResultCallback,
    ) -> ScheduledHandle {
        self.children.lock().unwrap().push(params);
        ScheduledHandle::ChildWorkflow(self.park(callback))
    }

    fn signal_external_workflow(&self, params: ExternalSignalParams, callback: ResultCallback) {
        self.signals.lock().unwrap().push(params);
        self.park(callback);
    }

    fn request_cancel(&self, handle: ScheduledHandle) {
        self.cancelled.lock().unwrap().push(handle);
    }

    fn complete(&self, result: Result<Payloads, ApplicationError>) {
        *self.completed.lock().unwrap() = Some(result);
    }
}
