//! Voice-assistant glue: turns recognised intents into scheduler requests.
//!
//! Wake-word detection, recognition and intent parsing live outside this
//! crate; they hand an [`Intent`] to [`Assistant::dispatch`] from whatever
//! context they run in.

use crate::audio::chime::confirmation_clip;
use crate::config::{ConversationConfig, MurmurConfig, PriorityConfig};
use crate::error::Result;
use crate::reminder::{Reminder, ReminderManager, parse_time_of_day};
use crate::scheduler::SchedulerHandle;
use crate::speech::{ReplyStream, Synthesizer};
use crate::task::{Task, TaskHandle};
use crate::tasks::{ClipTask, ConversationTask, PlaylistTask, SpeechTask};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// A recognised user request.
pub enum Intent {
    /// Wake word heard: play the confirmation chime.
    Wake,
    PlayMusic,
    PauseMusic,
    ResumeMusic,
    StopMusic,
    NextTrack,
    PrevTrack,
    VolumeUp,
    VolumeDown,
    /// Cancel whatever is currently speaking or playing.
    Skip,
    /// Speak a fixed text.
    Say(String),
    /// Speak a streamed reply.
    Chat(Box<dyn ReplyStream>),
    AddReminder { at: String, text: String },
    /// Id or 1-based position.
    RemoveReminder(String),
    ListReminders,
}

impl std::fmt::Debug for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wake => f.write_str("Wake"),
            Self::PlayMusic => f.write_str("PlayMusic"),
            Self::PauseMusic => f.write_str("PauseMusic"),
            Self::ResumeMusic => f.write_str("ResumeMusic"),
            Self::StopMusic => f.write_str("StopMusic"),
            Self::NextTrack => f.write_str("NextTrack"),
            Self::PrevTrack => f.write_str("PrevTrack"),
            Self::VolumeUp => f.write_str("VolumeUp"),
            Self::VolumeDown => f.write_str("VolumeDown"),
            Self::Skip => f.write_str("Skip"),
            Self::Say(text) => f.debug_tuple("Say").field(text).finish(),
            Self::Chat(_) => f.write_str("Chat(..)"),
            Self::AddReminder { at, text } => f
                .debug_struct("AddReminder")
                .field("at", at)
                .field("text", text)
                .finish(),
            Self::RemoveReminder(key) => f.debug_tuple("RemoveReminder").field(key).finish(),
            Self::ListReminders => f.write_str("ListReminders"),
        }
    }
}

/// Producer-side dispatcher.
pub struct Assistant {
    scheduler: SchedulerHandle,
    synth: Option<Arc<dyn Synthesizer>>,
    reminders: Arc<Mutex<ReminderManager>>,
    priorities: PriorityConfig,
    conversation: ConversationConfig,
    synth_timeout: Duration,
    confirm_clip: Option<PathBuf>,
    playlist: Option<TaskHandle>,
    chat: Option<TaskHandle>,
}

impl Assistant {
    /// `synth` of `None` disables spoken output; speech intents are then
    /// logged and dropped.
    pub fn new(
        config: &MurmurConfig,
        scheduler: SchedulerHandle,
        synth: Option<Arc<dyn Synthesizer>>,
        reminders: Arc<Mutex<ReminderManager>>,
    ) -> Self {
        let confirm_clip =
            match confirmation_clip(config.speech.confirm_clip.as_deref(), &config.speech.cache_dir) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("wake confirmation disabled: {e}");
                    None
                }
            };
        Self {
            scheduler,
            synth,
            reminders,
            priorities: config.priorities.clone(),
            conversation: config.conversation.clone(),
            synth_timeout: config.speech.synth_timeout(),
            confirm_clip,
            playlist: None,
            chat: None,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Current reminders in insertion order.
    pub fn reminders(&self) -> Vec<Reminder> {
        self.book().list().to_vec()
    }

    /// Act on one intent. Returns the handle of the task it enqueued, if any.
    ///
    /// # Errors
    ///
    /// Returns `Channel` once the scheduler has stopped, and `Config` for a
    /// reminder with an unreadable time.
    pub fn dispatch(&mut self, intent: Intent) -> Result<Option<TaskHandle>> {
        info!(?intent, "dispatching intent");
        match intent {
            Intent::Wake => self.wake(),
            Intent::PlayMusic => self.play_music(),
            Intent::PauseMusic => self.scheduler.pause_music().map(|()| None),
            Intent::ResumeMusic => self.scheduler.resume_music().map(|()| None),
            Intent::StopMusic => {
                self.playlist = None;
                self.scheduler.stop_music().map(|()| None)
            }
            Intent::NextTrack => self.scheduler.next_track().map(|()| None),
            Intent::PrevTrack => self.scheduler.prev_track().map(|()| None),
            Intent::VolumeUp => self.scheduler.volume_up().map(|()| None),
            Intent::VolumeDown => self.scheduler.volume_down().map(|()| None),
            Intent::Skip => self.scheduler.cancel_current().map(|()| None),
            Intent::Say(text) => self.say(text),
            Intent::Chat(replies) => self.chat(replies),
            Intent::AddReminder { at, text } => {
                let at = parse_time_of_day(&at)?;
                let at = at.format("%H:%M").to_string();
                self.book().add(&at, text.clone())?;
                self.say(format!("Reminder set for {at}: {text}"))
            }
            Intent::RemoveReminder(key) => {
                let removed = self.book().remove(&key);
                match removed {
                    Some(r) => self.say(format!("Removed the {} reminder.", r.at.format("%H:%M"))),
                    None => self.say(format!("There is no reminder {key}.")),
                }
            }
            Intent::ListReminders => {
                let text = describe_reminders(&self.reminders());
                self.say(text)
            }
        }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, ReminderManager> {
        self.reminders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn was_active(&self) -> bool {
        self.scheduler.sink_snapshot().active_before_transient
    }

    fn wake(&mut self) -> Result<Option<TaskHandle>> {
        let Some(clip) = self.confirm_clip.clone() else {
            return Ok(None);
        };
        let was_active = self.was_active();
        let task = Task::new("wake chime", self.priorities.clip, ClipTask::new(clip, was_active));
        self.scheduler.enqueue(task).map(Some)
    }

    fn play_music(&mut self) -> Result<Option<TaskHandle>> {
        if self.playlist.as_ref().is_some_and(|h| !h.is_finished()) {
            self.scheduler.resume_music()?;
            return Ok(None);
        }
        let task = Task::new("playlist", self.priorities.playlist, PlaylistTask::new());
        let handle = self.scheduler.enqueue(task)?;
        self.playlist = Some(handle.clone());
        Ok(Some(handle))
    }

    fn say(&mut self, text: String) -> Result<Option<TaskHandle>> {
        let Some(synth) = self.synth.clone() else {
            warn!(text = %text, "speech disabled, dropping utterance");
            return Ok(None);
        };
        let body = SpeechTask::new(text, synth, self.was_active()).with_timeout(self.synth_timeout);
        self.scheduler
            .enqueue(Task::new("speech", self.priorities.speech, body))
            .map(Some)
    }

    fn chat(&mut self, replies: Box<dyn ReplyStream>) -> Result<Option<TaskHandle>> {
        let Some(synth) = self.synth.clone() else {
            warn!("speech disabled, dropping reply");
            return Ok(None);
        };
        if let Some(previous) = self.chat.take().filter(|h| !h.is_finished()) {
            info!(task_id = %previous.id(), "superseding previous reply");
            self.scheduler.cancel_task(previous.id())?;
        }
        let body = ConversationTask::new(replies, synth, self.was_active())
            .with_timeouts(self.conversation.chunk_timeout(), self.synth_timeout)
            .resume_playlist(self.conversation.resume_playlist);
        let handle = self
            .scheduler
            .enqueue(Task::new("conversation", self.priorities.conversation, body))?;
        self.chat = Some(handle.clone());
        Ok(Some(handle))
    }
}

fn describe_reminders(reminders: &[Reminder]) -> String {
    match reminders {
        [] => "You have no reminders.".to_owned(),
        [one] => format!("You have one reminder: {} at {}.", one.message, one.at.format("%H:%M")),
        many => {
            let items: Vec<String> = many
                .iter()
                .map(|r| format!("{} at {}", r.message, r.at.format("%H:%M")))
                .collect();
            format!("You have {} reminders: {}.", many.len(), items.join("; "))
        }
    }
}
