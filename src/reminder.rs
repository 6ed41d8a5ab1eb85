//! Daily spoken reminders.
//!
//! [`ReminderManager`] keeps the reminder book; [`ReminderTicker`] is the
//! cron-style producer that checks it periodically and enqueues a speech
//! task for every reminder that comes due.

use crate::config::MurmurConfig;
use crate::error::{MurmurError, Result};
use crate::scheduler::SchedulerHandle;
use crate::speech::Synthesizer;
use crate::task::{Task, TaskHandle};
use crate::tasks::SpeechTask;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A reminder firing once a day at a local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    /// Short identifier (8 hex characters).
    pub id: String,
    /// Local time of day, minute resolution.
    pub at: NaiveTime,
    pub message: String,
    /// Day the reminder last fired (or was skipped because it was added late).
    pub last_fired: Option<NaiveDate>,
}

impl Reminder {
    fn is_due(&self, now: NaiveDateTime) -> bool {
        now.time() >= self.at && self.last_fired != Some(now.date())
    }
}

impl std::fmt::Display for Reminder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.at.format("%H:%M"), self.message)
    }
}

/// Ordered reminder book.
#[derive(Debug, Clone)]
pub struct ReminderManager {
    reminders: Vec<Reminder>,
    repeat_daily: bool,
}

impl ReminderManager {
    pub fn new(repeat_daily: bool) -> Self {
        Self {
            reminders: Vec::new(),
            repeat_daily,
        }
    }

    /// Add a reminder for `at` ("HH:MM", local time). Returns its id.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `at` is not a valid time of day.
    pub fn add(&mut self, at: &str, message: impl Into<String>) -> Result<String> {
        self.add_at(at, message, Local::now().naive_local())
    }

    /// Like [`add`](Self::add) with an explicit current time.
    ///
    /// A time already past today first fires tomorrow.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `at` is not a valid time of day.
    pub fn add_at(
        &mut self,
        at: &str,
        message: impl Into<String>,
        now: NaiveDateTime,
    ) -> Result<String> {
        let at = parse_time_of_day(at)?;
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);

        let reminder = Reminder {
            id: id.clone(),
            at,
            message: message.into(),
            last_fired: (now.time() >= at).then(|| now.date()),
        };
        info!(reminder_id = %id, at = %at.format("%H:%M"), "reminder added");
        self.reminders.push(reminder);
        Ok(id)
    }

    /// Reminders in insertion order.
    pub fn list(&self) -> &[Reminder] {
        &self.reminders
    }

    pub fn len(&self) -> usize {
        self.reminders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reminders.is_empty()
    }

    /// Remove by id or by 1-based position in [`list`](Self::list).
    pub fn remove(&mut self, key: &str) -> Option<Reminder> {
        let key = key.trim();
        let pos = match key.parse::<usize>() {
            Ok(n) if key.len() < 8 => n.checked_sub(1).filter(|i| *i < self.reminders.len()),
            _ => self.reminders.iter().position(|r| r.id == key),
        }?;
        let removed = self.reminders.remove(pos);
        info!(reminder_id = %removed.id, "reminder removed");
        Some(removed)
    }

    /// Reminders due at `now`, each at most once per day.
    ///
    /// Returned reminders are marked fired; without `repeat_daily` they are
    /// dropped from the book.
    pub fn due_at(&mut self, now: NaiveDateTime) -> Vec<Reminder> {
        let mut due = Vec::new();
        for reminder in &mut self.reminders {
            if reminder.is_due(now) {
                reminder.last_fired = Some(now.date());
                due.push(reminder.clone());
            }
        }
        if !self.repeat_daily && !due.is_empty() {
            self.reminders.retain(|r| !due.iter().any(|d| d.id == r.id));
        }
        due
    }
}

/// Parse "HH:MM" (or "H:MM").
///
/// # Errors
///
/// Returns `Config` for anything else.
pub fn parse_time_of_day(at: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(at.trim(), "%H:%M")
        .map_err(|e| MurmurError::Config(format!("invalid reminder time {at:?}: {e}")))
}

/// Text spoken when a reminder fires.
pub fn announcement(now: NaiveDateTime, message: &str) -> String {
    format!(
        "It is {:02}:{:02}. Reminder: {message}",
        now.hour(),
        now.minute()
    )
}

/// Periodic producer turning due reminders into speech tasks.
#[derive(Clone)]
pub struct ReminderTicker {
    reminders: Arc<Mutex<ReminderManager>>,
    scheduler: SchedulerHandle,
    synth: Arc<dyn Synthesizer>,
    priority: i32,
    synth_timeout: Duration,
    interval: Duration,
}

impl ReminderTicker {
    pub fn new(
        config: &MurmurConfig,
        reminders: Arc<Mutex<ReminderManager>>,
        scheduler: SchedulerHandle,
        synth: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            reminders,
            scheduler,
            synth,
            priority: config.priorities.reminder,
            synth_timeout: config.speech.synth_timeout(),
            interval: Duration::from_secs(config.reminders.tick_interval_secs.max(1)),
        }
    }

    /// Check the book every tick until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.fire_due(Local::now().naive_local());
                    }
                }
            }
            info!("reminder ticker stopped");
        })
    }

    /// Enqueue one speech task per reminder due at `now`.
    pub fn fire_due(&self, now: NaiveDateTime) -> Vec<TaskHandle> {
        let due = self
            .reminders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .due_at(now);
        if due.is_empty() {
            return Vec::new();
        }

        let was_active = self.scheduler.sink_snapshot().active_before_transient;
        let mut handles = Vec::with_capacity(due.len());
        for reminder in due {
            info!(reminder_id = %reminder.id, "reminder due");
            let body = SpeechTask::new(
                announcement(now, &reminder.message),
                Arc::clone(&self.synth),
                was_active,
            )
            .with_timeout(self.synth_timeout);
            let task = Task::new(format!("reminder {}", reminder.id), self.priority, body);
            match self.scheduler.enqueue(task) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(reminder_id = %reminder.id, "cannot enqueue reminder: {e}"),
            }
        }
        handles
    }
}
