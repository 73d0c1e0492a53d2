use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::bridge::codec::Codec;
use crate::bridge::command::{
    Command, DestroyWorkflow, InvokeQuery, InvokeSignal, StartWorkflow,
};
use crate::bridge::protocol::{Context, Failure, Message};
use crate::bridge::sequence::SequenceCounter;
use crate::converter::Payloads;
use crate::engine::{
    ActivityParams, ApplicationError, ChildWorkflowParams, ExternalSignalParams, ResultCallback,
    ScheduledHandle, WorkflowDefinition, WorkflowEnvironment,
};
use crate::error::{BridgeError, ProtocolError};
use crate::generation::GenerationCell;

type Queue = Arc<StdMutex<Vec<Message>>>;
type Scheduled = Arc<StdMutex<HashMap<u64, ScheduledHandle>>>;

/// One workflow run executing inside the workflow pool.
pub struct WorkflowProcess {
    codec: Arc<Codec>,
    generations: Arc<GenerationCell>,
    sequence: Arc<SequenceCounter>,
    env: Option<Arc<dyn WorkflowEnvironment>>,
    run_id: String,
    task_queue: String,
    /// Messages waiting for the next flush, including results pushed by
    /// engine callbacks.
    queue: Queue,
    /// Worker command id to engine handle, for cancellation.
    scheduled: Scheduled,
}

impl WorkflowProcess {
    pub fn new(
        codec: Arc<Codec>,
        generations: Arc<GenerationCell>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            codec,
            generations,
            sequence,
            env: None,
            run_id: String::new(),
            task_queue: String::new(),
            queue: Arc::new(StdMutex::new(Vec::new())),
            scheduled: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn push(&self, message: Message) {
        push(&self.queue, message);
    }

    fn env(&self) -> Result<&Arc<dyn WorkflowEnvironment>, BridgeError> {
        self.env.as_ref().ok_or_else(|| {
            BridgeError::from(ProtocolError::Malformed(
                "workflow has not been started".to_string(),
            ))
        })
    }

    fn context(&self, env: &dyn WorkflowEnvironment) -> Context {
        Context {
            task_queue: self.task_queue.clone(),
            tick_time: Some(env.now().to_rfc3339()),
            replay: env.is_replaying(),
            history_length: env.history_length(),
        }
    }

    /// Callback that queues the outcome of scheduled work as a result for
    /// the worker command `id`.
    fn callback(&self, id: u64) -> ResultCallback {
        let queue = Arc::clone(&self.queue);
        let scheduled = Arc::clone(&self.scheduled);
        let codec = Arc::clone(&self.codec);
        Box::new(move |result: Result<Payloads, ApplicationError>| {
            if let Ok(mut scheduled) = scheduled.lock() {
                scheduled.remove(&id);
            }
            let message = match result {
                Ok(payloads) => Message::result(id, payloads),
                Err(error) => {
                    let failure = codec
                        .converter()
                        .error_to_failure(&error)
                        .unwrap_or_else(|e| {
                            tracing::warn!(id, error = %e, "Failure details not convertible");
                            Failure::new(error.message.clone())
                        });
                    Message::failure(id, failure)
                }
            };
            push(&queue, message);
        })
    }

    /// Send queued messages and apply what the worker answers until nothing
    /// is left to send.
    async fn flush(&mut self) -> Result<(), BridgeError> {
        let env = Arc::clone(self.env()?);

        loop {
            let batch = match self.queue.lock() {
                Ok(mut queue) => std::mem::take(&mut *queue),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if batch.is_empty() {
                return Ok(());
            }

            let pool = self.generations.current()?.workflow_pool();
            let ctx = self.context(env.as_ref());
            let answer = self.codec.exchange(pool.as_ref(), &ctx, batch).await?;

            for message in answer {
                self.apply(env.as_ref(), message)?;
            }
        }
    }

    fn apply(&self, env: &dyn WorkflowEnvironment, message: Message) -> Result<(), BridgeError> {
        let Some(command) = message.command else {
            if let Some(failure) = message.failure {
                return Err(BridgeError::Application(
                    self.codec.converter().failure_to_error(&failure),
                ));
            }
            tracing::trace!(id = message.id, "Ignoring worker result");
            return Ok(());
        };

        let id = message.id;
        match command {
            Command::ExecuteActivity(cmd) => {
                let handle = env.execute_activity(
                    ActivityParams {
                        name: cmd.name,
                        input: cmd.args_payload,
                        options: cmd.options,
                    },
                    self.callback(id),
                );
                self.track(id, handle);
            }
            Command::NewTimer(cmd) => {
                let handle = env.new_timer(cmd.to_duration(), self.callback(id));
                self.track(id, handle);
            }
            Command::ExecuteChildWorkflow(cmd) => {
                let handle = env.execute_child_workflow(
                    ChildWorkflowParams {
                        name: cmd.name,
                        input: cmd.args_payload,
                        options: cmd.options,
                    },
                    self.callback(id),
                );
                self.track(id, handle);
            }
            Command::SignalExternalWorkflow(cmd) => {
                env.signal_external_workflow(
                    ExternalSignalParams {
                        namespace: cmd.namespace,
                        workflow_id: cmd.workflow_id,
                        run_id: cmd.run_id,
                        signal: cmd.signal,
                        input: cmd.args_payload,
                        child_workflow_only: cmd.child_workflow_only,
                    },
                    self.callback(id),
                );
            }
            Command::CompleteWorkflow(cmd) => {
                let result = match message.failure {
                    Some(failure) => Err(self.codec.converter().failure_to_error(&failure)),
                    None => Ok(cmd.result_payload),
                };
                tracing::debug!(run_id = %self.run_id, failed = result.is_err(), "Workflow completed");
                env.complete(result);
            }
            Command::Cancel(cmd) => {
                for target in &cmd.ids {
                    let handle = self
                        .scheduled
                        .lock()
                        .ok()
                        .and_then(|mut s| s.remove(target));
                    match handle {
                        Some(handle) => env.request_cancel(handle),
                        None => tracing::debug!(id = target, "Cancel for unknown or settled command"),
                    }
                }
                self.push(Message::result(id, Payloads::default()));
            }
            other => {
                return Err(ProtocolError::UnexpectedCommand {
                    name: other.name().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn track(&self, id: u64, handle: ScheduledHandle) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.insert(id, handle);
        }
    }
}

fn push(queue: &Queue, message: Message) {
    match queue.lock() {
        Ok(mut queue) => queue.push(message),
        Err(poisoned) => poisoned.into_inner().push(message),
    }
}

#[async_trait]
impl WorkflowDefinition for WorkflowProcess {
    async fn execute(
        &mut self,
        env: Arc<dyn WorkflowEnvironment>,
        input: Payloads,
    ) -> Result<(), BridgeError> {
        let info = env.workflow_info();
        let start = StartWorkflow::from_environment(&info, &input, self.codec.converter())?;
        self.run_id = info.run_id.clone();
        self.task_queue = info.task_queue.clone();
        self.env = Some(env);

        tracing::debug!(
            workflow = %info.workflow_type,
            workflow_id = %info.workflow_id,
            run_id = %info.run_id,
            "Starting workflow"
        );
        self.push(Message::command(self.sequence.next(), start, Payloads::default()));
        self.flush().await
    }

    async fn on_workflow_task_started(&mut self) -> Result<(), BridgeError> {
        self.flush().await
    }

    async fn handle_signal(&mut self, name: &str, input: Payloads) -> Result<(), BridgeError> {
        let signal = InvokeSignal {
            run_id: self.run_id.clone(),
            name: name.to_string(),
            args: self.codec.converter().from_payloads(&input)?,
        };
        self.push(Message::command(self.sequence.next(), signal, Payloads::default()));
        Ok(())
    }

    async fn handle_query(&mut self, name: &str, args: Payloads) -> Result<Payloads, BridgeError> {
        let env = Arc::clone(self.env()?);
        let query = InvokeQuery {
            run_id: self.run_id.clone(),
            name: name.to_string(),
            args: self.codec.converter().from_payloads(&args)?,
        };
        let request = Message::command(self.sequence.next(), query, Payloads::default());

        let pool = self.generations.current()?.workflow_pool();
        let ctx = self.context(env.as_ref());
        let results = self.codec.execute(pool.as_ref(), &ctx, vec![request]).await?;
        let [result]: [Message; 1] = results.try_into().map_err(|v: Vec<Message>| {
            ProtocolError::ResultCount {
                expected: 1,
                actual: v.len(),
            }
        })?;

        match result.failure {
            Some(failure) => Err(BridgeError::Application(
                self.codec.converter().failure_to_error(&failure),
            )),
            None => Ok(result.payloads),
        }
    }

    fn stack_trace(&self) -> String {
        let mut waiting: Vec<_> = self
            .scheduled
            .lock()
            .map(|s| s.iter().map(|(id, h)| (*id, *h)).collect())
            .unwrap_or_default();
        waiting.sort_by_key(|(id, _)| *id);

        let waiting = waiting
            .iter()
            .map(|(id, handle)| format!("{id}:{handle:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("run {} waiting on [{}]", self.run_id, waiting)
    }

    async fn close(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        let destroy = Message::command(
            self.sequence.next(),
            DestroyWorkflow {
                run_id: self.run_id.clone(),
            },
            Payloads::default(),
        );

        let pool = match self.generations.current() {
            Ok(generation) => generation.workflow_pool(),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Cannot destroy workflow");
                return;
            }
        };
        let ctx = self.context(env.as_ref());
        if let Err(e) = self.codec.execute(pool.as_ref(), &ctx, vec![destroy]).await {
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to destroy workflow");
        }
    }
}
