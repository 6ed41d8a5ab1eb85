//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use murmur::audio::silent::SilentOutput;
use murmur::audio::AudioSink;
use murmur::error::Result;
use murmur::speech::Synthesizer;
use murmur::task::{Signal, TaskBody, TaskContext, TaskKind};
use murmur::{MurmurConfig, MurmurError, Scheduler, SchedulerEvent, SchedulerHandle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 8_000;

pub fn write_tone(path: &Path, length: Duration) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (length.as_secs_f64() * f64::from(SAMPLE_RATE)).round() as u64;
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for n in 0..frames {
        let t = n as f64 / f64::from(SAMPLE_RATE);
        let sample = (t * 330.0 * std::f64::consts::TAU).sin() * 0.2;
        writer.write_sample((sample * f64::from(i16::MAX)) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Fast timings so scenarios settle within a few hundred milliseconds.
pub fn test_config() -> MurmurConfig {
    let mut config = MurmurConfig::default();
    config.scheduler.tick_interval_ms = 10;
    config.scheduler.checkpoint_interval_ms = 20;
    config.scheduler.cancel_grace_ms = 300;
    config
}

/// A running scheduler over a silent sink and a recorded event log.
pub struct Harness {
    pub handle: SchedulerHandle,
    pub output: SilentOutput,
    pub tracks: Vec<PathBuf>,
    pub events: Arc<Mutex<Vec<SchedulerEvent>>>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn start(track_lengths: &[Duration]) -> Self {
        Self::with_config(track_lengths, test_config())
    }

    pub fn with_config(track_lengths: &[Duration], config: MurmurConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        let tracks: Vec<PathBuf> = track_lengths
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let path = music.join(format!("{:02}-song.wav", i + 1));
                write_tone(&path, *len);
                path
            })
            .collect();

        let output = SilentOutput::new();
        let sink = AudioSink::new(Arc::new(output.clone()), tracks.clone(), true, 0.0).unwrap();
        let (scheduler, handle) = Scheduler::new(&config, sink);

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = handle.subscribe();
        let log = Arc::clone(&events);
        tokio::spawn(async move {
            while let Ok(ev) = rx.recv().await {
                log.lock().unwrap().push(ev);
            }
        });
        scheduler.run();

        Self {
            handle,
            output,
            tracks,
            events,
            dir,
        }
    }

    /// Write a clip of the given length into the fixture dir.
    pub fn clip(&self, name: &str, length: Duration) -> PathBuf {
        let path = self.dir.path().join(name);
        write_tone(&path, length);
        path
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Offsets at which `track` was (re)started, in order.
    pub fn starts_of(&self, track: &Path) -> Vec<Duration> {
        self.output
            .starts()
            .into_iter()
            .filter(|s| s.path == track)
            .map(|s| s.offset)
            .collect()
    }
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Synthesizer writing a fixed-length tone per utterance.
pub struct ToneSynth {
    dir: PathBuf,
    length: Duration,
    counter: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
}

impl ToneSynth {
    pub fn new(dir: &Path, length: Duration) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            length,
            counter: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Synthesizer for ToneSynth {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        self.texts.lock().unwrap().push(text.to_owned());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("utterance-{n}.wav"));
        write_tone(&path, self.length);
        Ok(path)
    }
}

/// Body that needs `work` of un-paused running time to complete.
pub struct Work {
    pub resumable: bool,
    pub work: Duration,
}

#[async_trait]
impl TaskBody for Work {
    fn kind(&self) -> TaskKind {
        TaskKind::Custom
    }

    fn resumable(&self) -> bool {
        self.resumable
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let mut done = Duration::ZERO;
        let mut last = tokio::time::Instant::now();
        while done < self.work {
            match ctx.next_signal().await {
                Signal::Continue => {
                    done += last.elapsed();
                }
                Signal::Pause => {
                    done += last.elapsed();
                    ctx.wait_resumed().await?;
                }
                Signal::Cancel => return Err(MurmurError::Cancelled),
            }
            last = tokio::time::Instant::now();
        }
        Ok(())
    }
}

/// Body that never looks at its signals; only an abort stops it.
pub struct Stubborn;

#[async_trait]
impl TaskBody for Stubborn {
    fn kind(&self) -> TaskKind {
        TaskKind::Custom
    }

    async fn execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}
