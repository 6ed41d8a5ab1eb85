//! Scheduler control loop.
//!
//! One tokio task owns the ready queue, the running slot and the paused
//! stack, and is the only place task state moves between them. Producers
//! reach it through [`SchedulerHandle`], which posts commands into the loop.

use crate::audio::sink::{AudioSink, SinkSnapshot};
use crate::config::{MurmurConfig, PreemptAction};
use crate::error::{MurmurError, Result};
use crate::scheduler::events::SchedulerEvent;
use crate::scheduler::policy::PreemptionPolicy;
use crate::scheduler::queue::ReadyQueue;
use crate::task::{HostEnv, Task, TaskFailure, TaskHandle, TaskId, TaskKind, TaskMeta, TaskState};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

/// A task as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub state: TaskState,
}

impl TaskView {
    fn of(task: &Task) -> Self {
        Self {
            meta: task.meta().clone(),
            state: task.state(),
        }
    }
}

/// One finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRunRecord {
    pub task_id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub priority: i32,
    pub outcome: TaskState,
    /// `None` for tasks that never ran.
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: u64,
    pub failure: Option<TaskFailure>,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: Option<TaskView>,
    /// Admission order.
    pub queued: Vec<TaskView>,
    /// Bottom first; the last entry resumes next.
    pub paused: Vec<TaskView>,
    pub sink: SinkSnapshot,
    /// Oldest first.
    pub history: Vec<TaskRunRecord>,
}

enum Command {
    Enqueue(Task),
    Cancel(TaskId),
    CancelCurrent,
    PauseMusic,
    ResumeMusic,
    StopMusic,
    NextTrack,
    PrevTrack,
    Volume(f32),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown,
}

/// A started task and its host.
struct Slot {
    task: Task,
    host: JoinHandle<()>,
    started_at_ms: u64,
}

/// Priority-preemptive scheduler over one [`AudioSink`].
pub struct Scheduler {
    queue: ReadyQueue,
    running: Option<Slot>,
    paused: Vec<Slot>,
    policy: PreemptionPolicy,
    env: HostEnv,
    tick_interval: Duration,
    /// Recent run history.
    history: Vec<TaskRunRecord>,
    max_history_entries: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<SchedulerEvent>,
    /// Music resume requested while another task held the sink.
    music_deferred: bool,
    stopped: CancellationToken,
}

/// Thread-safe producer API. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SchedulerEvent>,
    sink: AudioSink,
    volume_step_db: f32,
    stopped: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler bound to `sink` and the handle producers use.
    pub fn new(config: &MurmurConfig, sink: AudioSink) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let stopped = CancellationToken::new();

        let env = HostEnv {
            sink: sink.clone(),
            checkpoint: config.scheduler.checkpoint_interval(),
            cancel_grace: config.scheduler.cancel_grace(),
            events: events.clone(),
        };
        let scheduler = Self {
            queue: ReadyQueue::new(),
            running: None,
            paused: Vec::new(),
            policy: PreemptionPolicy::from_config(&config.preemption),
            env,
            tick_interval: config.scheduler.tick_interval(),
            history: Vec::new(),
            max_history_entries: config.scheduler.history_limit.max(1),
            commands,
            events: events.clone(),
            music_deferred: false,
            stopped: stopped.clone(),
        };
        let handle = SchedulerHandle {
            tx,
            events,
            sink,
            volume_step_db: config.audio.volume_step_db,
            stopped,
        };
        (scheduler, handle)
    }

    /// Override the run-history limit.
    pub fn with_history_limit(mut self, max_entries: usize) -> Self {
        self.max_history_entries = max_entries.max(1);
        self
    }

    /// Start the control loop. It ends on [`SchedulerHandle::shutdown`] or
    /// when every handle is dropped.
    pub fn run(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler started");
            let forwarder = self.forward_sink_events();

            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let command = tokio::select! {
                    cmd = self.commands.recv() => Some(cmd),
                    _ = interval.tick() => None,
                };
                match command {
                    Some(None) | Some(Some(Command::Shutdown)) => break,
                    Some(Some(cmd)) => self.handle(cmd).await,
                    None => {}
                }
                self.step().await;
            }

            self.shutdown().await;
            self.stopped.cancel();
            let _ = forwarder.await;
            info!("scheduler stopped");
        })
    }

    fn forward_sink_events(&self) -> JoinHandle<()> {
        let mut rx = self.env.sink.subscribe();
        let events = self.events.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    () = stopped.cancelled() => break,
                    ev = rx.recv() => ev,
                };
                match received {
                    Ok(ev) => {
                        let _ = events.send(SchedulerEvent::Music(ev));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "sink event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(task) => self.enqueue(task),
            Command::Cancel(id) => {
                if !self.cancel(id) {
                    debug!(task_id = %id, "cancel for unknown or finished task");
                }
            }
            Command::CancelCurrent => {
                if let Some(id) = self.running.as_ref().map(|s| s.task.id()) {
                    self.cancel(id);
                }
            }
            Command::PauseMusic => {
                self.music_deferred = false;
                self.sink_op(|s| {
                    s.pause();
                    Ok(())
                })
                .await;
            }
            Command::ResumeMusic => {
                if self.sink_is_free() {
                    self.sink_op(|s| s.play()).await;
                } else {
                    info!("music resume deferred until the sink is free");
                    self.music_deferred = true;
                }
            }
            Command::StopMusic => self.stop_music().await,
            Command::NextTrack => self.change_track(true).await,
            Command::PrevTrack => self.change_track(false).await,
            Command::Volume(delta) => {
                self.sink_op(move |s| s.set_volume(delta).map(|_| ())).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn enqueue(&mut self, task: Task) {
        if task.state() != TaskState::Pending {
            error!(task_id = %task.id(), task = %task.meta().name, state = %task.state(), "only pending tasks can be enqueued");
            return;
        }
        let meta = task.meta().clone();
        let seq = self.queue.push(task);
        info!(task_id = %meta.id, task = %meta.name, priority = meta.priority, seq, "task enqueued");
        self.emit(SchedulerEvent::Enqueued { task: meta, seq });
    }

    /// Cancel a queued, running or paused task. Returns whether it was found.
    fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(task) = self.queue.remove(id) {
            task.cancel();
            let meta = task.meta().clone();
            self.record(&task, None);
            self.emit(SchedulerEvent::Removed { task: meta });
            return true;
        }
        if self.running.as_ref().is_some_and(|s| s.task.id() == id) {
            if let Some(slot) = self.running.take() {
                slot.task.cancel();
                self.retire(slot);
            }
            return true;
        }
        if let Some(pos) = self.paused.iter().position(|s| s.task.id() == id) {
            let slot = self.paused.remove(pos);
            slot.task.cancel();
            self.retire(slot);
            return true;
        }
        false
    }

    async fn stop_music(&mut self) {
        let queued = self.queue.remove_where(|m| m.kind == TaskKind::Playlist);
        for task in queued {
            task.cancel();
            let meta = task.meta().clone();
            self.record(&task, None);
            self.emit(SchedulerEvent::Removed { task: meta });
        }
        let stacked: Vec<TaskId> = self
            .paused
            .iter()
            .filter(|s| s.task.meta().kind == TaskKind::Playlist)
            .map(|s| s.task.id())
            .collect();
        for id in stacked {
            self.cancel(id);
        }
        if let Some(id) = self
            .running
            .as_ref()
            .filter(|s| s.task.meta().kind == TaskKind::Playlist)
            .map(|s| s.task.id())
        {
            self.cancel(id);
        }
        self.music_deferred = false;
        self.sink_op(|s| {
            s.stop();
            Ok(())
        })
        .await;
    }

    async fn change_track(&mut self, forward: bool) {
        if !self.sink_is_free() {
            info!("track change ignored while another task holds the sink");
            return;
        }
        if forward {
            self.sink_op(|s| s.next()).await;
        } else {
            self.sink_op(|s| s.prev()).await;
        }
    }

    /// Nothing but (at most) the playlist task is using the sink.
    fn sink_is_free(&self) -> bool {
        self.running
            .as_ref()
            .is_none_or(|s| s.task.meta().kind == TaskKind::Playlist)
    }

    async fn sink_op<F>(&mut self, op: F)
    where
        F: FnOnce(&AudioSink) -> Result<()> + Send + 'static,
    {
        let sink = self.env.sink.clone();
        if let Err(e) = sink.blocking(op).await {
            warn!("music control failed: {e}");
        }
    }

    // ── Control loop ─────────────────────────────────────────────────────

    /// One iteration: reap, admit or resume, preempt.
    async fn step(&mut self) {
        self.reap();

        if self.running.is_none() {
            if self.queue.is_empty() {
                self.resume_paused();
            } else {
                self.admit();
            }
        }
        self.preempt();

        if self.music_deferred && self.running.is_none() && self.queue.is_empty() {
            self.music_deferred = false;
            info!("applying deferred music resume");
            self.sink_op(|s| s.play()).await;
        }
    }

    fn reap(&mut self) {
        let done = self
            .running
            .as_ref()
            .is_some_and(|s| s.task.state().is_terminal() || s.host.is_finished());
        if done {
            if let Some(slot) = self.running.take() {
                self.retire(slot);
            }
        }
    }

    fn admit(&mut self) {
        while self.running.is_none() {
            let Some(task) = self.queue.pop() else {
                return;
            };
            self.start(task);
        }
    }

    fn resume_paused(&mut self) {
        while let Some(slot) = self.paused.pop() {
            if slot.task.state().is_terminal() {
                self.retire(slot);
                continue;
            }
            if slot.task.resume() {
                self.env.sink.claim(slot.task.id());
                let meta = slot.task.meta().clone();
                self.running = Some(slot);
                self.emit(SchedulerEvent::Resumed { task: meta });
                return;
            }
            warn!(task_id = %slot.task.id(), state = %slot.task.state(), "paused task could not resume");
            slot.task.cancel();
            self.retire(slot);
        }
    }

    fn preempt(&mut self) {
        let Some(head) = self.queue.peek_priority() else {
            return;
        };
        let Some(current) = self.running.as_ref().map(|s| s.task.meta().priority) else {
            return;
        };
        if head <= current {
            return;
        }
        let (Some(next), Some(victim)) = (self.queue.pop(), self.running.take()) else {
            return;
        };

        let action = self.policy.decide(next.meta(), victim.task.meta());
        info!(
            victim = %victim.task.meta().name,
            victim_priority = current,
            by = %next.meta().name,
            by_priority = head,
            ?action,
            "preempting"
        );
        self.emit(SchedulerEvent::Preempted {
            victim: victim.task.meta().clone(),
            by: next.meta().clone(),
            action,
        });

        match action {
            PreemptAction::Suspend if victim.task.pause() => {
                self.emit(SchedulerEvent::Paused {
                    task: victim.task.meta().clone(),
                });
                self.paused.push(victim);
            }
            _ => {
                victim.task.cancel();
                self.retire(victim);
            }
        }
        self.start(next);
    }

    fn start(&mut self, mut task: Task) {
        if task.state().is_terminal() {
            self.record(&task, None);
            return;
        }
        let id = task.id();
        self.env.sink.claim(id);
        match task.start(&self.env) {
            Ok(host) => {
                let meta = task.meta().clone();
                self.running = Some(Slot {
                    task,
                    host,
                    started_at_ms: now_epoch_millis(),
                });
                self.emit(SchedulerEvent::Started { task: meta });
            }
            Err(e) => {
                self.env.sink.release(id);
                error!(task_id = %id, task = %task.meta().name, "task could not start: {e}");
                self.record(&task, None);
            }
        }
    }

    /// Record a task leaving the scheduler after having run.
    fn retire(&mut self, slot: Slot) {
        self.env.sink.release(slot.task.id());
        let state = slot.task.state();
        if !state.is_terminal() {
            warn!(task_id = %slot.task.id(), state = %state, "host exited without a terminal state");
        }
        let meta = slot.task.meta().clone();
        let failure = slot.task.control().failure();
        self.record(&slot.task, Some(slot.started_at_ms));
        self.emit(SchedulerEvent::Finished {
            task: meta,
            state,
            failure,
        });
    }

    fn record(&mut self, task: &Task, started_at_ms: Option<u64>) {
        let meta = task.meta();
        self.push_history(TaskRunRecord {
            task_id: meta.id,
            name: meta.name.clone(),
            kind: meta.kind,
            priority: meta.priority,
            outcome: task.state(),
            started_at_ms,
            finished_at_ms: now_epoch_millis(),
            failure: task.control().failure(),
        });
    }

    fn push_history(&mut self, run: TaskRunRecord) {
        self.history.push(run);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history.len() <= self.max_history_entries {
            return;
        }
        let drop_count = self.history.len().saturating_sub(self.max_history_entries);
        self.history.drain(0..drop_count);
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            running: self.running.as_ref().map(|s| TaskView::of(&s.task)),
            queued: self
                .queue
                .metas()
                .into_iter()
                .map(|meta| TaskView {
                    meta,
                    state: TaskState::Pending,
                })
                .collect(),
            paused: self.paused.iter().map(|s| TaskView::of(&s.task)).collect(),
            sink: self.env.sink.snapshot(),
            history: self.history.clone(),
        }
    }

    /// Cancel everything and silence the sink.
    async fn shutdown(&mut self) {
        let queued: Vec<Task> = std::iter::from_fn(|| self.queue.pop()).collect();
        for task in queued {
            task.cancel();
            self.record(&task, None);
        }

        let mut hosts = Vec::new();
        let mut slots: Vec<Slot> = self.paused.drain(..).collect();
        slots.extend(self.running.take());
        for slot in slots {
            slot.task.cancel();
            let state = slot.task.state();
            let meta = slot.task.meta().clone();
            self.record(&slot.task, Some(slot.started_at_ms));
            self.emit(SchedulerEvent::Finished {
                task: meta,
                state,
                failure: None,
            });
            hosts.push(slot.host);
        }

        let grace = self.env.cancel_grace + self.tick_interval;
        for host in hosts {
            if tokio::time::timeout(grace, host).await.is_err() {
                warn!("task host did not exit during shutdown");
            }
        }
        self.env.sink.silence();
        info!(history = self.history.len(), "scheduler drained");
    }
}

impl SchedulerHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| MurmurError::Channel("scheduler loop has stopped".into()))
    }

    /// Submit a task. Safe from any thread.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn enqueue(&self, task: Task) -> Result<TaskHandle> {
        let handle = task.handle();
        self.send(Command::Enqueue(task))?;
        Ok(handle)
    }

    /// Cancel a task wherever it is (queued, running or paused).
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn cancel_task(&self, id: TaskId) -> Result<()> {
        self.send(Command::Cancel(id))
    }

    /// Cancel whatever is running.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn cancel_current(&self) -> Result<()> {
        self.send(Command::CancelCurrent)
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn pause_music(&self) -> Result<()> {
        self.send(Command::PauseMusic)
    }

    /// Resume the playlist now, or once the current task releases the sink.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn resume_music(&self) -> Result<()> {
        self.send(Command::ResumeMusic)
    }

    /// Cancel every playlist task and stop the sink playlist.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn stop_music(&self) -> Result<()> {
        self.send(Command::StopMusic)
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn next_track(&self) -> Result<()> {
        self.send(Command::NextTrack)
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn prev_track(&self) -> Result<()> {
        self.send(Command::PrevTrack)
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn volume_up(&self) -> Result<()> {
        self.send(Command::Volume(self.volume_step_db))
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn volume_down(&self) -> Result<()> {
        self.send(Command::Volume(-self.volume_step_db))
    }

    /// Read-only sink state, for sampling `was_active_before`.
    pub fn sink_snapshot(&self) -> SinkSnapshot {
        self.sink.snapshot()
    }

    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await
            .map_err(|_| MurmurError::Channel("scheduler dropped snapshot request".into()))
    }

    /// Snapshot from a non-async thread. Must not be called on a runtime thread.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has stopped.
    pub fn blocking_snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.blocking_recv()
            .map_err(|_| MurmurError::Channel("scheduler dropped snapshot request".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Ask the loop to cancel everything and exit.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the scheduler has already stopped.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Resolves once the loop has drained and exited.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_millis() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}
