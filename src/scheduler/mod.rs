//! Priority-preemptive task scheduler.
//!
//! Admits the highest-priority ready task onto the shared audio sink,
//! preempts lower-priority work (suspending resumable victims on a LIFO
//! stack, cancelling the rest) and resumes suspended work once the queue
//! drains.

pub mod events;
pub mod policy;
pub mod queue;
pub mod runner;

pub use events::SchedulerEvent;
pub use policy::PreemptionPolicy;
pub use queue::ReadyQueue;
pub use runner::{Scheduler, SchedulerHandle, SchedulerSnapshot, TaskRunRecord, TaskView};
