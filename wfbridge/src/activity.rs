//! Activity execution bridge.
//!
//! Every activity attempt the engine hands us becomes one `InvokeActivity`
//! exchange against the activity pool of the generation current at dispatch
//! time. While the exchange is outstanding the attempt is tracked by task
//! token so heartbeat and cancellation callers can find its context.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::bridge::codec::Codec;
use crate::bridge::command::InvokeActivity;
use crate::bridge::protocol::{Context, Message};
use crate::bridge::sequence::SequenceCounter;
use crate::converter::Payloads;
use crate::engine::{ActivityContext, ActivityHandler, ActivityOutcome, TaskToken};
use crate::error::{BridgeError, ProtocolError};
use crate::generation::GenerationCell;

/// Failure message a worker uses to say it will complete the activity later.
pub const DO_NOT_COMPLETE_ON_RETURN: &str = "doNotCompleteOnReturn";

/// Removes the in-flight entry however the dispatch ends.
struct RunningGuard<'a> {
    running: &'a DashMap<TaskToken, ActivityContext>,
    token: TaskToken,
}

impl<'a> RunningGuard<'a> {
    fn register(running: &'a DashMap<TaskToken, ActivityContext>, ctx: &ActivityContext) -> Self {
        let token = ctx.task_token().clone();
        running.insert(token.clone(), ctx.clone());
        Self { running, token }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.token);
    }
}

pub struct ActivityBridge {
    codec: Arc<Codec>,
    generations: Arc<GenerationCell>,
    sequence: Arc<SequenceCounter>,
    running: DashMap<TaskToken, ActivityContext>,
}

impl ActivityBridge {
    pub fn new(
        codec: Arc<Codec>,
        generations: Arc<GenerationCell>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            codec,
            generations,
            sequence,
            running: DashMap::new(),
        }
    }

    pub async fn execute_activity(
        &self,
        ctx: ActivityContext,
        mut args: Payloads,
    ) -> Result<ActivityOutcome, BridgeError> {
        let heartbeat = ctx.heartbeat_details().cloned().unwrap_or_default();
        let info = ctx.info().clone();
        let command = InvokeActivity {
            name: info.activity_type.name.clone(),
            heartbeat_details: heartbeat.len(),
            info,
        };
        args.extend(heartbeat);
        let request = Message::command(self.sequence.next(), command, args);

        let _running = RunningGuard::register(&self.running, &ctx);
        let pool = self.generations.current()?.activity_pool();

        tracing::debug!(
            id = request.id,
            activity = %ctx.info().activity_type.name,
            attempt = ctx.info().attempt,
            "Dispatching activity"
        );
        let results = self
            .codec
            .execute(
                pool.as_ref(),
                &Context::for_task_queue(&ctx.info().task_queue),
                vec![request],
            )
            .await?;

        let [result]: [Message; 1] = results.try_into().map_err(|v: Vec<Message>| {
            ProtocolError::ResultCount {
                expected: 1,
                actual: v.len(),
            }
        })?;

        match result.failure {
            Some(failure) if failure.message == DO_NOT_COMPLETE_ON_RETURN => {
                tracing::debug!(task_token = %ctx.task_token(), "Activity will complete asynchronously");
                Ok(ActivityOutcome::Pending)
            }
            Some(failure) => Err(BridgeError::Application(
                self.codec.converter().failure_to_error(&failure),
            )),
            None => Ok(ActivityOutcome::Completed(result.payloads)),
        }
    }

    /// Context of a dispatch that is still waiting on its worker.
    pub fn activity_context(&self, token: &TaskToken) -> Result<ActivityContext, BridgeError> {
        self.running
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BridgeError::NotRunning(token.clone()))
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl ActivityHandler for ActivityBridge {
    async fn execute(
        &self,
        ctx: ActivityContext,
        args: Payloads,
    ) -> Result<ActivityOutcome, BridgeError> {
        self.execute_activity(ctx, args).await
    }
}
