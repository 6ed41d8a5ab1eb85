//! Task-host boundary.
//!
//! Every body runs in its own tokio task. Whatever happens inside (error,
//! panic, refusal to honour cancel) is converted here into a terminal
//! [`TaskState`]; nothing escapes into the scheduler loop.

use super::{Task, TaskContext, TaskControl, TaskFailure, TaskState};
use crate::audio::sink::AudioSink;
use crate::error::{FailureKind, MurmurError, Result};
use crate::scheduler::events::SchedulerEvent;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Environment lent to every started task.
#[derive(Clone)]
pub struct HostEnv {
    pub sink: AudioSink,
    /// Longest a body may go without seeing its signals.
    pub checkpoint: Duration,
    /// Time a cancelled body gets to unwind before it is aborted.
    pub cancel_grace: Duration,
    pub events: broadcast::Sender<SchedulerEvent>,
}

impl Task {
    /// Move the task to `Running` and spawn its body.
    ///
    /// The returned handle completes once the task has reached a terminal
    /// state and the body has been dropped.
    ///
    /// # Errors
    ///
    /// Returns `Programmer` if the task was already started or is no longer
    /// pending.
    pub fn start(&mut self, env: &HostEnv) -> Result<JoinHandle<()>> {
        let Some(body) = self.take_body() else {
            error!(task_id = %self.id(), task = %self.meta().name, "task started twice");
            return Err(MurmurError::Programmer(format!(
                "task {} was already started",
                self.meta().name
            )));
        };
        self.control.transition(TaskState::Running)?;

        let meta = self.meta();
        info!(
            task_id = %meta.id,
            task = %meta.name,
            kind = %meta.kind,
            priority = meta.priority,
            resumable = meta.resumable,
            "task started"
        );

        let control = self.control.clone();
        let ctx = TaskContext::new(
            control.clone(),
            env.sink.clone(),
            env.checkpoint,
            env.events.clone(),
        );
        Ok(tokio::spawn(host(
            control,
            body,
            ctx,
            env.sink.clone(),
            env.cancel_grace,
        )))
    }
}

async fn host(
    control: TaskControl,
    mut body: Box<dyn super::TaskBody>,
    ctx: TaskContext,
    sink: AudioSink,
    grace: Duration,
) {
    let mut run = tokio::spawn(async move { body.execute(&ctx).await });

    let outcome = tokio::select! {
        biased;
        res = &mut run => res,
        () = control.cancel_token().cancelled() => {
            match tokio::time::timeout(grace, &mut run).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(
                        task_id = %control.id(),
                        task = %control.meta().name,
                        grace_ms = grace.as_millis() as u64,
                        "task ignored cancel, aborting"
                    );
                    run.abort();
                    let _ = run.await;
                    let id = control.id();
                    match sink.blocking(move |s| Ok(s.stop_for(id))).await {
                        Ok(true) => {}
                        Ok(false) => debug!(task_id = %id, "sink already handed on, left playing"),
                        Err(e) => warn!("cannot stop sink after abort: {e}"),
                    }
                    control.finish(TaskState::Cancelled, None);
                    return;
                }
            }
        }
    };

    settle(&control, outcome);
}

/// Map a body outcome to its terminal state.
fn settle(control: &TaskControl, outcome: std::result::Result<Result<()>, JoinError>) {
    let cancelled = control.is_cancelled();
    let (state, failure) = match outcome {
        Ok(Ok(())) if cancelled => (TaskState::Cancelled, None),
        Ok(Ok(())) => (TaskState::Completed, None),
        Ok(Err(MurmurError::Cancelled)) => (TaskState::Cancelled, None),
        Ok(Err(e)) if cancelled => {
            debug!(task_id = %control.id(), "error while unwinding: {e}");
            (TaskState::Cancelled, None)
        }
        Ok(Err(e)) => (
            TaskState::Failed,
            Some(TaskFailure {
                kind: e.failure_kind(),
                message: e.to_string(),
            }),
        ),
        Err(e) if e.is_panic() => (
            TaskState::Failed,
            Some(TaskFailure {
                kind: FailureKind::Programmer,
                message: format!("task body panicked: {}", panic_message(e)),
            }),
        ),
        Err(_) => (TaskState::Cancelled, None),
    };

    let meta = control.meta();
    if !control.finish(state, failure.clone()) {
        debug!(task_id = %meta.id, reported = %state, "task already terminal");
        return;
    }
    match failure {
        Some(f) => error!(
            task_id = %meta.id,
            task = %meta.name,
            kind = ?f.kind,
            "task failed: {}",
            f.message
        ),
        None => info!(task_id = %meta.id, task = %meta.name, state = %state, "task finished"),
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_owned()),
        Err(_) => "<cancelled>".to_owned(),
    }
}
