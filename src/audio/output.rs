//! Device-level output abstraction used by the sink.

use crate::audio::decode::Pcm;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A media file prepared for playback by an [`AudioOutput`].
#[derive(Debug, Clone)]
pub struct Clip {
    pub path: PathBuf,
    pub duration: Duration,
    /// Decoded samples, present for backends that render audio.
    pub pcm: Option<Arc<Pcm>>,
}

impl Clip {
    /// Display name of the underlying file.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A physical (or simulated) output that can render clips.
pub trait AudioOutput: Send + Sync {
    /// Load and validate a file. Blocking; may decode the whole file.
    ///
    /// # Errors
    ///
    /// Returns `Media` for missing or undecodable files.
    fn load(&self, path: &Path) -> Result<Clip>;

    /// Start rendering `clip` from `offset` with `gain_db` applied.
    ///
    /// # Errors
    ///
    /// Returns `Device` when the output cannot be opened or started.
    fn start(&self, clip: &Clip, offset: Duration, gain_db: f32) -> Result<Box<dyn Voice>>;
}

/// One clip currently being rendered.
pub trait Voice: Send {
    /// Time rendered since [`AudioOutput::start`], excluding the start offset.
    fn elapsed(&self) -> Duration;

    /// Whether the clip ran out of samples.
    fn is_finished(&self) -> bool;

    /// Stop rendering. Idempotent.
    fn stop(&mut self);
}

/// Convert a dB gain into a linear amplitude factor.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_and_six_db() {
        assert!((db_to_gain(0.0) - 1.0).abs() < f32::EPSILON);
        assert!((db_to_gain(6.0) - 1.995).abs() < 0.01);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 0.01);
    }

    #[test]
    fn clip_name_is_file_name() {
        let clip = Clip {
            path: PathBuf::from("/music/01 - intro.mp3"),
            duration: Duration::from_secs(1),
            pcm: None,
        };
        assert_eq!(clip.name(), "01 - intro.mp3");
    }
}
