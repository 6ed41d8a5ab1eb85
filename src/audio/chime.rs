//! Generated wake confirmation chime.

use crate::error::{MurmurError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

const CHIME_FILE: &str = "confirm-chime.wav";
const CHIME_RATE: u32 = 22_050;
/// (frequency Hz, length ms) of each tone.
const CHIME_TONES: [(f32, u32); 2] = [(880.0, 90), (1320.0, 140)];
const CHIME_AMPLITUDE: f32 = 0.3;
/// Fade applied at both ends of each tone to avoid clicks (ms).
const CHIME_FADE_MS: u32 = 8;

/// Resolve the confirmation clip: `configured` if set, otherwise a two-tone
/// chime rendered into `cache_dir` on first use.
///
/// # Errors
///
/// Returns `Media` if the chime cannot be written.
pub fn confirmation_clip(configured: Option<&Path>, cache_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    let path = cache_dir.join(CHIME_FILE);
    if !path.exists() {
        std::fs::create_dir_all(cache_dir)?;
        render_chime(&path)?;
        debug!(path = %path.display(), "rendered confirmation chime");
    }
    Ok(path)
}

fn render_chime(path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: CHIME_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let media = |e: hound::Error| MurmurError::Media(format!("cannot write chime: {e}"));
    let mut writer = hound::WavWriter::create(path, spec).map_err(media)?;

    let fade = (CHIME_RATE * CHIME_FADE_MS / 1000) as usize;
    for (freq, ms) in CHIME_TONES {
        let len = (CHIME_RATE * ms / 1000) as usize;
        for n in 0..len {
            let t = n as f32 / CHIME_RATE as f32;
            let edge = n.min(len - 1 - n);
            let envelope = if edge < fade {
                edge as f32 / fade as f32
            } else {
                1.0
            };
            let sample = (t * freq * std::f32::consts::TAU).sin() * CHIME_AMPLITUDE * envelope;
            writer
                .write_sample((sample * f32::from(i16::MAX)) as i16)
                .map_err(media)?;
        }
    }
    writer.finalize().map_err(media)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::decode::probe_duration;
    use std::time::Duration;

    #[test]
    fn renders_once_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = confirmation_clip(None, dir.path()).unwrap();
        assert!(path.exists());

        let length = probe_duration(&path).unwrap();
        assert!(length >= Duration::from_millis(220) && length <= Duration::from_millis(240));

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let again = confirmation_clip(None, dir.path()).unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::metadata(&again).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn configured_clip_wins() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("ding.mp3");
        let path = confirmation_clip(Some(&custom), dir.path()).unwrap();
        assert_eq!(path, custom);
        assert!(!dir.path().join(CHIME_FILE).exists());
    }
}
