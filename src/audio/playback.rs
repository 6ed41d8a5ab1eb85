//! Audio playback to system speakers via cpal.

use crate::audio::decode::{Pcm, decode_file};
use crate::audio::output::{AudioOutput, Clip, Voice, db_to_gain};
use crate::config::AudioConfig;
use crate::error::{MurmurError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Poll interval of the thread that keeps a stream alive.
const STREAM_KEEPALIVE_POLL: Duration = Duration::from_millis(10);

/// Audio playback to system speakers via cpal.
///
/// Each [`Voice`] owns a dedicated thread holding the cpal stream, since
/// streams are not `Send` on every host.
pub struct CpalOutput {
    device: cpal::Device,
}

impl CpalOutput {
    /// Open the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| MurmurError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| MurmurError::Device(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| MurmurError::Device("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self { device })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| MurmurError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioOutput for CpalOutput {
    fn load(&self, path: &Path) -> Result<Clip> {
        let pcm = decode_file(path)?;
        Ok(Clip {
            path: path.to_path_buf(),
            duration: pcm.duration(),
            pcm: Some(Arc::new(pcm)),
        })
    }

    fn start(&self, clip: &Clip, offset: Duration, gain_db: f32) -> Result<Box<dyn Voice>> {
        let pcm = match clip.pcm {
            Some(ref pcm) => Arc::clone(pcm),
            None => Arc::new(decode_file(&clip.path)?),
        };

        let shared = Arc::new(StreamShared {
            position: AtomicUsize::new(pcm.sample_index_at(offset)),
            start_position: pcm.sample_index_at(offset),
            finished: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let device = self.device.clone();
        let thread_shared = Arc::clone(&shared);
        let thread_pcm = Arc::clone(&pcm);
        let gain = db_to_gain(gain_db);
        let name = clip.name();

        let thread = std::thread::Builder::new()
            .name("murmur-voice".into())
            .spawn(move || run_stream(device, thread_pcm, gain, thread_shared, ready_tx))
            .map_err(|e| MurmurError::Device(format!("cannot spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(clip = %name, offset_ms = offset.as_millis() as u64, "voice started");
                Ok(Box::new(CpalVoice {
                    shared,
                    pcm,
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(MurmurError::Device("output thread exited early".into())),
        }
    }
}

/// State shared between a voice handle and its stream callback.
struct StreamShared {
    /// Next interleaved sample to render.
    position: AtomicUsize,
    start_position: usize,
    finished: AtomicBool,
    stop: AtomicBool,
}

fn run_stream(
    device: cpal::Device,
    pcm: Arc<Pcm>,
    gain: f32,
    shared: Arc<StreamShared>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let stream_config = StreamConfig {
        channels: pcm.channels,
        sample_rate: pcm.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let cb_shared = Arc::clone(&shared);
    let cb_pcm = Arc::clone(&pcm);
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
            let mut pos = cb_shared.position.load(Ordering::Relaxed);
            for sample in data.iter_mut() {
                if pos < cb_pcm.samples.len() && !cb_shared.stop.load(Ordering::Relaxed) {
                    *sample = cb_pcm.samples[pos] * gain;
                    pos += 1;
                } else {
                    *sample = 0.0;
                    cb_shared.finished.store(true, Ordering::Relaxed);
                }
            }
            cb_shared.position.store(pos, Ordering::Relaxed);
        },
        move |err| {
            error!("audio output stream error: {err}");
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(MurmurError::Device(format!(
                "failed to build output stream: {e}"
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(MurmurError::Device(format!(
            "failed to start output stream: {e}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while !shared.stop.load(Ordering::Relaxed) && !shared.finished.load(Ordering::Relaxed) {
        std::thread::sleep(STREAM_KEEPALIVE_POLL);
    }
    drop(stream);
}

struct CpalVoice {
    shared: Arc<StreamShared>,
    pcm: Arc<Pcm>,
    thread: Option<JoinHandle<()>>,
}

impl Voice for CpalVoice {
    fn elapsed(&self) -> Duration {
        let rendered = self
            .shared
            .position
            .load(Ordering::Relaxed)
            .saturating_sub(self.shared.start_position);
        let frames = rendered / usize::from(self.pcm.channels.max(1));
        if self.pcm.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / f64::from(self.pcm.sample_rate))
    }

    fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalVoice {
    fn drop(&mut self) {
        self.stop();
    }
}
