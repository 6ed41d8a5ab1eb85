//! Configuration types for the audio scheduler.

use crate::task::TaskKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MurmurConfig {
    /// Output device and gain settings.
    pub audio: AudioConfig,
    /// Background playlist settings.
    pub playlist: PlaylistConfig,
    /// Control loop timing.
    pub scheduler: SchedulerConfig,
    /// Priority assigned to each built-in task kind.
    pub priorities: PriorityConfig,
    /// Victim treatment when one task preempts another.
    pub preemption: PreemptionConfig,
    /// Speech synthesis collaborator settings.
    pub speech: SpeechConfig,
    /// Streamed conversation settings.
    pub conversation: ConversationConfig,
    /// Reminder ticker settings.
    pub reminders: ReminderConfig,
}

/// Which output implementation the sink drives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// Real speakers via cpal.
    #[default]
    Cpal,
    /// Clock-driven output that produces no sound (headless hosts, tests).
    Silent,
}

/// Audio output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output backend.
    pub backend: OutputBackend,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Gain applied at startup, in dB.
    pub initial_volume_db: f32,
    /// Step used by the volume up/down controls, in dB.
    pub volume_step_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: OutputBackend::default(),
            output_device: None,
            initial_volume_db: 0.0,
            volume_step_db: 3.0,
        }
    }
}

/// Background playlist configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// Directory scanned (non-recursively) for tracks at startup.
    pub music_dir: PathBuf,
    /// File extensions accepted as tracks, lowercase without the dot.
    pub extensions: Vec<String>,
    /// Advance to the first track after the last one ends.
    pub loop_playlist: bool,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            music_dir: default_data_dir().join("music"),
            extensions: ["mp3", "wav", "m4a", "aac"]
                .iter()
                .map(|e| (*e).to_owned())
                .collect(),
            loop_playlist: true,
        }
    }
}

/// Control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Idle sleep between control loop iterations (ms).
    ///
    /// Bounds the latency between a task finishing and the next admission.
    pub tick_interval_ms: u64,
    /// Longest interval a task body may go without polling its signals (ms).
    pub checkpoint_interval_ms: u64,
    /// How long a cancelled body may take to unwind before it is aborted (ms).
    pub cancel_grace_ms: u64,
    /// Number of finished task records kept for snapshots.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            checkpoint_interval_ms: 100,
            cancel_grace_ms: 500,
            history_limit: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Priorities of the built-in task kinds (higher = more urgent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub playlist: i32,
    pub conversation: i32,
    pub clip: i32,
    pub speech: i32,
    pub reminder: i32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            playlist: 1,
            conversation: 3,
            clip: 5,
            speech: 10,
            reminder: 20,
        }
    }
}

/// What happens to the running task when a higher-priority one arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptAction {
    /// Pause the victim and push it on the paused stack (resumable victims only).
    Suspend,
    /// Cancel the victim.
    Cancel,
}

/// One preemption rule, matched on the (preemptor, victim) kind pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionRule {
    pub preemptor: TaskKind,
    pub victim: TaskKind,
    pub action: PreemptAction,
}

/// Preemption rule set.
///
/// Pairs without a rule suspend resumable victims and cancel the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionConfig {
    pub rules: Vec<PreemptionRule>,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            rules: vec![PreemptionRule {
                preemptor: TaskKind::Conversation,
                victim: TaskKind::Playlist,
                action: PreemptAction::Cancel,
            }],
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// External synthesizer argv. `{text}` and `{out}` are substituted.
    ///
    /// Empty disables spoken output.
    pub synth_command: Vec<String>,
    /// Time budget for one synthesis call (seconds).
    pub synth_timeout_secs: u64,
    /// Directory receiving synthesized clips and the generated chime.
    pub cache_dir: PathBuf,
    /// Wake confirmation clip. A two-tone chime is generated when unset.
    pub confirm_clip: Option<PathBuf>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            synth_command: vec![
                "espeak-ng".to_owned(),
                "-w".to_owned(),
                "{out}".to_owned(),
                "{text}".to_owned(),
            ],
            synth_timeout_secs: 15,
            cache_dir: default_cache_dir(),
            confirm_clip: None,
        }
    }
}

impl SpeechConfig {
    pub fn synth_timeout(&self) -> Duration {
        Duration::from_secs(self.synth_timeout_secs)
    }
}

/// Streamed conversation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Restart the playlist after a reply if it was audible before the request.
    pub resume_playlist: bool,
    /// Budget for receiving one spoken chunk from the reply stream (seconds).
    pub chunk_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            resume_playlist: false,
            chunk_timeout_secs: 20,
        }
    }
}

impl ConversationConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Reminder ticker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// Interval between due checks (seconds).
    pub tick_interval_secs: u64,
    /// Keep reminders after they fire so they repeat the next day.
    pub repeat_daily: bool,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            repeat_daily: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("murmur")
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("murmur")
}

impl MurmurConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::MurmurError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::MurmurError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/murmur/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("murmur")
            .join("config.toml")
    }
}
