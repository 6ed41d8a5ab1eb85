//! Shared test utilities used across multiple test modules.

#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sample rate of generated fixture audio.
pub const FIXTURE_SAMPLE_RATE: u32 = 8_000;

/// Write a mono 16-bit sine tone WAV of the given length.
pub fn write_tone_wav(path: &Path, length: Duration) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: FIXTURE_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (length.as_secs_f64() * f64::from(FIXTURE_SAMPLE_RATE)).round() as u64;
    let mut writer = hound::WavWriter::create(path, spec).expect("create fixture wav");
    for n in 0..frames {
        let t = n as f64 / f64::from(FIXTURE_SAMPLE_RATE);
        let sample = (t * 440.0 * std::f64::consts::TAU).sin() * 0.25;
        writer
            .write_sample((sample * f64::from(i16::MAX)) as i16)
            .expect("write fixture sample");
    }
    writer.finalize().expect("finalize fixture wav");
}

/// Populate `dir` with one track per entry of `lengths`, named so that
/// sorted order matches the slice order.
pub fn playlist_dir(dir: &Path, lengths: &[Duration]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).expect("create playlist dir");
    lengths
        .iter()
        .enumerate()
        .map(|(i, len)| {
            let path = dir.join(format!("{:02}-track.wav", i + 1));
            write_tone_wav(&path, *len);
            path
        })
        .collect()
}
