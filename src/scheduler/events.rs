//! Observer events published by the scheduler.

use crate::audio::sink::SinkEvent;
use crate::config::PreemptAction;
use crate::task::{TaskFailure, TaskId, TaskMeta, TaskState};

/// Broadcast to every [`subscribe`](crate::scheduler::SchedulerHandle::subscribe)r.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Accepted into the ready queue with its arrival sequence.
    Enqueued { task: TaskMeta, seq: u64 },
    /// Pending -> Running.
    Started { task: TaskMeta },
    /// Suspended and pushed on the paused stack.
    Paused { task: TaskMeta },
    /// Popped from the paused stack back into the running slot.
    Resumed { task: TaskMeta },
    /// `victim` gave way to the higher-priority `by`.
    Preempted {
        victim: TaskMeta,
        by: TaskMeta,
        action: PreemptAction,
    },
    /// Left the scheduler in a terminal state.
    Finished {
        task: TaskMeta,
        state: TaskState,
        failure: Option<TaskFailure>,
    },
    /// Cancelled while still queued; it never ran.
    Removed { task: TaskMeta },
    /// Text of a spoken conversational reply.
    Reply {
        task_id: TaskId,
        text: String,
        complete: bool,
    },
    /// Forwarded sink activity.
    Music(SinkEvent),
}
