//! File decoding and duration probing via symphonia.

use crate::error::{MurmurError, Result};
use std::path::Path;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Interleaved f32 samples decoded from a media file.
#[derive(Debug, Clone)]
pub struct Pcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Pcm {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playing time of the whole buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Index of the first interleaved sample at `offset` into the buffer.
    pub fn sample_index_at(&self, offset: Duration) -> usize {
        let frame = (offset.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        frame
            .min(self.frames())
            .saturating_mul(usize::from(self.channels.max(1)))
    }
}

fn open_format(path: &Path) -> Result<Box<dyn FormatReader>> {
    let file = std::fs::File::open(path)
        .map_err(|e| MurmurError::Media(format!("cannot open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| MurmurError::Media(format!("failed to probe {}: {e}", path.display())))?;
    Ok(probed.format)
}

/// Decode a whole file into interleaved f32 samples.
///
/// # Errors
///
/// Returns [`MurmurError::Media`] when the file is missing, has no audio
/// track or cannot be decoded.
pub fn decode_file(path: &Path) -> Result<Pcm> {
    let mut format = open_format(path)?;
    let track = format
        .default_track()
        .ok_or_else(|| MurmurError::Media(format!("no audio track in {}", path.display())))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| MurmurError::Media(format!("unknown sample rate in {}", path.display())))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| MurmurError::Media(format!("failed to create decoder: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut channels: u16 = codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(MurmurError::Media(format!("audio read error: {e}")));
            }
            Err(e) => return Err(MurmurError::Media(format!("audio read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(MurmurError::Media(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count() as u16;
        let frames = decoded.frames() as u64;
        let required = (frames as usize).saturating_mul(usize::from(channels));

        let needs_new = match sample_buf.as_ref() {
            Some(b) => b.capacity() < required,
            None => true,
        };
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }

        if let Some(b) = sample_buf.as_mut() {
            b.copy_interleaved_ref(decoded);
            samples.extend_from_slice(b.samples());
        }
    }

    if samples.is_empty() {
        return Err(MurmurError::Media(format!(
            "no decodable audio in {}",
            path.display()
        )));
    }

    Ok(Pcm {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

/// Determine the playing time of a file without keeping its samples.
///
/// Uses the container's frame count when present and falls back to a full
/// decode otherwise (e.g. VBR mp3 without a Xing header).
///
/// # Errors
///
/// Returns [`MurmurError::Media`] when the file cannot be probed or decoded.
pub fn probe_duration(path: &Path) -> Result<Duration> {
    let format = open_format(path)?;
    let track = format
        .default_track()
        .ok_or_else(|| MurmurError::Media(format!("no audio track in {}", path.display())))?;

    if let (Some(frames), Some(rate)) = (track.codec_params.n_frames, track.codec_params.sample_rate) {
        if rate > 0 && frames > 0 {
            return Ok(Duration::from_secs_f64(frames as f64 / f64::from(rate)));
        }
    }

    Ok(decode_file(path)?.duration())
}
