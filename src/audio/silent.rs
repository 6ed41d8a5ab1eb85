//! Clock-driven output that tracks position without producing sound.
//!
//! Used on headless hosts and by the test suite. Clip durations come from
//! the real files, so playlist timing behaves exactly as on a device.

use crate::audio::decode::probe_duration;
use crate::audio::output::{AudioOutput, Clip, Voice};
use crate::error::{MurmurError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A record of one `start` call, for inspection in tests and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRecord {
    pub path: PathBuf,
    pub offset: Duration,
    pub gain_db: f32,
}

/// Output that plays nothing but keeps time.
#[derive(Debug, Default, Clone)]
pub struct SilentOutput {
    starts: Arc<Mutex<Vec<StartRecord>>>,
    device_failure: Arc<AtomicBool>,
    load_delay_ms: Arc<AtomicU64>,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start so far, oldest first.
    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent starts fail with a device error.
    pub fn set_device_failure(&self, failing: bool) {
        self.device_failure.store(failing, Ordering::SeqCst);
    }

    /// Make every load take at least `delay`, like decoding a long file.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl AudioOutput for SilentOutput {
    fn load(&self, path: &Path) -> Result<Clip> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let duration = probe_duration(path)?;
        Ok(Clip {
            path: path.to_path_buf(),
            duration,
            pcm: None,
        })
    }

    fn start(&self, clip: &Clip, offset: Duration, gain_db: f32) -> Result<Box<dyn Voice>> {
        if self.device_failure.load(Ordering::SeqCst) {
            return Err(MurmurError::Device("silent output set to fail".into()));
        }
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StartRecord {
                path: clip.path.clone(),
                offset,
                gain_db,
            });
        Ok(Box::new(SilentVoice {
            started_at: Instant::now(),
            remaining: clip.duration.saturating_sub(offset),
            stopped_after: None,
        }))
    }
}

struct SilentVoice {
    started_at: Instant,
    remaining: Duration,
    stopped_after: Option<Duration>,
}

impl Voice for SilentVoice {
    fn elapsed(&self) -> Duration {
        self.stopped_after
            .unwrap_or_else(|| self.started_at.elapsed())
            .min(self.remaining)
    }

    fn is_finished(&self) -> bool {
        self.elapsed() >= self.remaining
    }

    fn stop(&mut self) {
        if self.stopped_after.is_none() {
            self.stopped_after = Some(self.started_at.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::write_tone_wav;

    #[test]
    fn voice_freezes_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_tone_wav(&path, Duration::from_secs(2));

        let out = SilentOutput::new();
        let clip = out.load(&path).unwrap();
        let mut voice = out.start(&clip, Duration::ZERO, 0.0).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        voice.stop();
        let frozen = voice.elapsed();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(voice.elapsed(), frozen);
        assert!(frozen >= Duration::from_millis(30));
        assert!(!voice.is_finished());
    }

    #[test]
    fn offset_past_end_is_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_tone_wav(&path, Duration::from_millis(200));

        let out = SilentOutput::new();
        let clip = out.load(&path).unwrap();
        let voice = out.start(&clip, Duration::from_secs(1), 0.0).unwrap();
        assert!(voice.is_finished());
    }

    #[test]
    fn records_starts_and_injects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_tone_wav(&path, Duration::from_millis(200));

        let out = SilentOutput::new();
        let clip = out.load(&path).unwrap();
        let _voice = out.start(&clip, Duration::from_millis(50), -3.0).unwrap();
        assert_eq!(
            out.starts(),
            vec![StartRecord {
                path: path.clone(),
                offset: Duration::from_millis(50),
                gain_db: -3.0
            }]
        );

        out.set_device_failure(true);
        assert!(matches!(
            out.start(&clip, Duration::ZERO, 0.0),
            Err(MurmurError::Device(_))
        ));
    }
}
