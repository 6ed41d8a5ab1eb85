//! Murmur: priority-preemptive scheduling of a single shared audio output.
//!
//! A background playlist, confirmation chimes, spoken read-outs and streamed
//! conversational replies all compete for one speaker. Producers submit
//! [`Task`]s to the [`Scheduler`]; it runs at most one at a time, preempts
//! lower-priority work and resumes suspended work in LIFO order.
//!
//! # Architecture
//!
//! - **Audio sink**: playlist bookkeeping and transient clips over an
//!   [`audio::AudioOutput`] (`cpal` speakers or a silent clock)
//! - **Tasks**: cooperative bodies polling pause/cancel signals
//! - **Scheduler**: a single tokio control loop fed through a channel
//! - **Producers**: [`assistant::Assistant`] intent dispatch and the
//!   [`reminder::ReminderTicker`]

pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod reminder;
pub mod scheduler;
pub mod speech;
pub mod task;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::MurmurConfig;
pub use error::{FailureKind, MurmurError, Result};
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerHandle, SchedulerSnapshot};
pub use task::{Task, TaskBody, TaskContext, TaskHandle, TaskId, TaskKind, TaskState};
