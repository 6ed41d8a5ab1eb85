//! Task model: identity, lifecycle state and the cooperative signal contract.
//!
//! A [`Task`] pairs shared [`TaskControl`] state with a [`TaskBody`]. The
//! scheduler owns the `Task`; producers keep a [`TaskHandle`]; the running
//! body sees a [`TaskContext`]. All three observe the same control block.

pub mod host;

use crate::audio::sink::AudioSink;
use crate::error::{FailureKind, MurmurError, Result};
use crate::scheduler::events::SchedulerEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use host::HostEnv;

/// Opaque unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Built-in task families, used to match preemption rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Background music playlist.
    Playlist,
    /// Pre-rendered one-shot clip (confirmation chime).
    Clip,
    /// Synthesized speech read-out.
    Speech,
    /// Streamed conversational reply.
    Conversation,
    /// Any other body.
    Custom,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Playlist => "playlist",
            Self::Clip => "clip",
            Self::Speech => "speech",
            Self::Conversation => "conversation",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A paused body may still finish on its own if it completed before
    /// observing the pause signal.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled)
                | (Running, Paused | Cancelled | Completed | Failed)
                | (Paused, Running | Cancelled | Completed | Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    /// Higher runs first.
    pub priority: i32,
    pub resumable: bool,
}

/// Failure recorded when a task ends in [`TaskState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Shared control block: signals and state of one task.
#[derive(Clone)]
pub struct TaskControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    meta: TaskMeta,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    state: watch::Sender<TaskState>,
    failure: Mutex<Option<TaskFailure>>,
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("meta", &self.inner.meta)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskControl {
    fn new(meta: TaskMeta) -> Self {
        let (pause, _) = watch::channel(false);
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            inner: Arc::new(ControlInner {
                meta,
                cancel: CancellationToken::new(),
                pause,
                state,
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.inner.meta
    }

    pub fn id(&self) -> TaskId {
        self.inner.meta.id
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        self.inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.pause.borrow()
    }

    /// Apply a checked transition.
    ///
    /// # Errors
    ///
    /// Returns `Programmer` for an illegal transition; the state is unchanged.
    pub fn transition(&self, next: TaskState) -> Result<TaskState> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(prev) => {
                debug!(task_id = %self.id(), task = %self.inner.meta.name, from = %prev, to = %next, "task state");
                Ok(prev)
            }
            None => Err(MurmurError::Programmer(format!(
                "task {} cannot go from {} to {next}",
                self.inner.meta.name,
                self.state()
            ))),
        }
    }

    /// Ask a running resumable task to suspend.
    ///
    /// Returns `false` (and does nothing) for non-resumable or non-running
    /// tasks; callers must cancel those instead.
    pub fn pause(&self) -> bool {
        if !self.inner.meta.resumable || self.state() != TaskState::Running {
            return false;
        }
        if self.transition(TaskState::Paused).is_err() {
            return false;
        }
        self.inner.pause.send_replace(true);
        info!(task_id = %self.id(), task = %self.inner.meta.name, "task paused");
        true
    }

    /// Let a paused task continue. No-op unless the task is paused.
    pub fn resume(&self) -> bool {
        if self.state() != TaskState::Paused {
            return false;
        }
        if self.transition(TaskState::Running).is_err() {
            return false;
        }
        self.inner.pause.send_replace(false);
        info!(task_id = %self.id(), task = %self.inner.meta.name, "task resumed");
        true
    }

    /// Cancel the task. Idempotent; terminal tasks are left untouched.
    ///
    /// Returns `true` on the call that moved the task to `Cancelled`.
    pub fn cancel(&self) -> bool {
        self.inner.cancel.cancel();
        let cancelled = self.transition(TaskState::Cancelled).is_ok();
        if cancelled {
            info!(task_id = %self.id(), task = %self.inner.meta.name, "task cancelled");
        }
        cancelled
    }

    /// Record the outcome reported by the task host, unless already terminal.
    pub(crate) fn finish(&self, state: TaskState, failure: Option<TaskFailure>) -> bool {
        if self.transition(state).is_err() {
            return false;
        }
        if let Some(failure) = failure {
            *self
                .inner
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(failure);
        }
        true
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.inner.pause.subscribe()
    }

    fn state_receiver(&self) -> watch::Receiver<TaskState> {
        self.inner.state.subscribe()
    }
}

/// Work performed by a task while it holds the sink.
#[async_trait]
pub trait TaskBody: Send {
    fn kind(&self) -> TaskKind;

    /// Whether the body can be suspended and later continued in place.
    fn resumable(&self) -> bool {
        false
    }

    /// Run to completion, cancellation or failure.
    ///
    /// Implementations poll [`TaskContext::next_signal`] (or an equivalent
    /// select) at least once per checkpoint interval and leave the sink
    /// stopped when cancelled.
    async fn execute(&mut self, ctx: &TaskContext) -> Result<()>;
}

/// A schedulable unit of work.
pub struct Task {
    control: TaskControl,
    body: Option<Box<dyn TaskBody>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("control", &self.control)
            .field("started", &self.body.is_none())
            .finish()
    }
}

impl Task {
    /// Wrap `body` into a pending task. Kind and resumability come from the body.
    pub fn new(name: impl Into<String>, priority: i32, body: impl TaskBody + 'static) -> Self {
        let meta = TaskMeta {
            id: TaskId::new(),
            name: name.into(),
            kind: body.kind(),
            priority,
            resumable: body.resumable(),
        };
        Self {
            control: TaskControl::new(meta),
            body: Some(Box::new(body)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.control.id()
    }

    pub fn meta(&self) -> &TaskMeta {
        self.control.meta()
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            control: self.control.clone(),
        }
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    fn take_body(&mut self) -> Option<Box<dyn TaskBody>> {
        self.body.take()
    }
}

/// Producer-side view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    control: TaskControl,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.control.id()
    }

    pub fn meta(&self) -> &TaskMeta {
        self.control.meta()
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        self.control.failure()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait until the task reaches a terminal state.
    pub async fn finished(&self) -> TaskState {
        self.wait_for(TaskState::is_terminal).await
    }

    /// Wait until the task state satisfies `pred` and return that state.
    pub async fn wait_for(&self, pred: impl Fn(TaskState) -> bool) -> TaskState {
        let mut rx = self.control.state_receiver();
        loop {
            let state = *rx.borrow_and_update();
            if pred(state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Cooperative checkpoint result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Pause,
    Cancel,
}

/// What a running body may touch.
pub struct TaskContext {
    control: TaskControl,
    sink: AudioSink,
    checkpoint: Duration,
    events: broadcast::Sender<SchedulerEvent>,
}

impl TaskContext {
    pub fn new(
        control: TaskControl,
        sink: AudioSink,
        checkpoint: Duration,
        events: broadcast::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            control,
            sink,
            checkpoint,
            events,
        }
    }

    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    pub fn meta(&self) -> &TaskMeta {
        self.control.meta()
    }

    pub fn checkpoint_interval(&self) -> Duration {
        self.checkpoint
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Resolves when the task is cancelled.
    pub async fn cancelled(&self) {
        self.control.cancel_token().cancelled().await;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.control.cancel_token()
    }

    /// Wait at most one checkpoint interval for a pause or cancel signal.
    ///
    /// Both signals are level-triggered: a pending signal is reported
    /// immediately. Cancel wins over pause.
    pub async fn next_signal(&self) -> Signal {
        if self.is_cancelled() {
            return Signal::Cancel;
        }
        if self.is_paused() {
            return Signal::Pause;
        }
        let rx = self.control.pause_receiver();
        tokio::select! {
            biased;
            () = self.cancelled() => Signal::Cancel,
            () = wait_until_paused(rx) => Signal::Pause,
            () = tokio::time::sleep(self.checkpoint) => Signal::Continue,
        }
    }

    /// Block while the pause signal is set.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the task is cancelled while waiting.
    pub async fn wait_resumed(&self) -> Result<()> {
        let mut rx = self.control.pause_receiver();
        loop {
            if self.is_cancelled() {
                return Err(MurmurError::Cancelled);
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                return Ok(());
            }
            tokio::select! {
                biased;
                () = self.cancelled() => return Err(MurmurError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(MurmurError::Cancelled);
                    }
                }
            }
        }
    }

    /// Publish an observer event on behalf of the task.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}

async fn wait_until_paused(mut rx: watch::Receiver<bool>) {
    loop {
        let paused = *rx.borrow_and_update();
        if paused {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
