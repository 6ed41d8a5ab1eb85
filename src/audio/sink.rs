//! The shared audio sink: one output, a fixed playlist and transient clips.
//!
//! Logical ownership is arbitrated by the scheduler (only the running task
//! drives the sink) and recorded here with [`AudioSink::claim`]. The internal
//! mutex only guards bookkeeping against the track-end timer, which runs
//! concurrently with control calls. Decoding never happens under it.

use crate::audio::output::{AudioOutput, Clip, Voice};
use crate::audio::timer::TrackTimer;
use crate::config::{AudioConfig, PlaylistConfig};
use crate::error::{MurmurError, Result};
use crate::task::TaskId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra time a finished transient may take to drain the device buffer.
const TRANSIENT_DRAIN_GRACE: Duration = Duration::from_millis(300);
const TRANSIENT_POLL: Duration = Duration::from_millis(20);
const EVENT_CHANNEL_SIZE: usize = 64;

/// Observable sink activity.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    TrackStarted {
        index: usize,
        name: String,
        offset: Duration,
    },
    Paused {
        index: usize,
        offset: Duration,
    },
    Stopped,
    PlaylistFinished,
    VolumeChanged {
        volume_db: f32,
    },
    TransientStarted {
        path: PathBuf,
    },
    TransientFinished {
        path: PathBuf,
        interrupted: bool,
    },
}

/// Read-only view of the sink, safe to hand to producers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkSnapshot {
    pub track_index: usize,
    pub track: Option<String>,
    pub position_ms: u64,
    pub volume_db: f32,
    /// A playlist track is audibly playing.
    pub is_playing: bool,
    pub paused: bool,
    /// The playlist intends to be playing (possibly deferred behind a clip).
    pub playlist_active: bool,
    pub transient_active: bool,
    /// The playlist ran out of tracks with looping disabled.
    pub finished: bool,
    /// What a producer should record as "was the playlist active" before
    /// enqueueing a transient clip.
    pub active_before_transient: bool,
}

/// Handle to the shared sink. Cheap to clone.
#[derive(Clone)]
pub struct AudioSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    output: Arc<dyn AudioOutput>,
    playlist: Vec<PathBuf>,
    loop_playlist: bool,
    runtime: Handle,
    state: Mutex<SinkState>,
    events: broadcast::Sender<SinkEvent>,
    next_transient_id: AtomicU64,
}

#[derive(Default)]
struct SinkState {
    index: usize,
    /// Position in the current track where the running voice started, or
    /// where playback was paused.
    offset: Duration,
    volume_db: f32,
    paused: bool,
    playlist_active: bool,
    finished: bool,
    /// Playlist was asked to play while a transient held the output.
    resume_pending: bool,
    /// The playlist was audible when a transient took the output over.
    displaced: bool,
    generation: u64,
    /// A track is being decoded with the lock released.
    loading: bool,
    /// Task the scheduler last handed the sink to.
    owner: Option<TaskId>,
    track: Option<Box<dyn Voice>>,
    /// Loaded clip for `index`, kept so pause/resume does not re-decode.
    clip: Option<Clip>,
    transient: Option<TransientSlot>,
    timer: Option<TrackTimer>,
}

struct TransientSlot {
    id: u64,
    path: PathBuf,
    voice: Box<dyn Voice>,
    resume_playlist: bool,
}

impl AudioSink {
    /// Create a sink over an explicit playlist.
    ///
    /// # Errors
    ///
    /// Returns `Config` when called outside a tokio runtime.
    pub fn new(
        output: Arc<dyn AudioOutput>,
        playlist: Vec<PathBuf>,
        loop_playlist: bool,
        volume_db: f32,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            MurmurError::Config("audio sink must be created inside a tokio runtime".into())
        })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        info!(tracks = playlist.len(), loop_playlist, "audio sink ready");
        Ok(Self {
            inner: Arc::new(SinkInner {
                output,
                playlist,
                loop_playlist,
                runtime,
                state: Mutex::new(SinkState {
                    volume_db,
                    ..SinkState::default()
                }),
                events,
                next_transient_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create a sink whose playlist is the sorted contents of `playlist.music_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Media` when the directory holds no tracks.
    pub fn from_config(
        output: Arc<dyn AudioOutput>,
        playlist: &PlaylistConfig,
        audio: &AudioConfig,
    ) -> Result<Self> {
        let tracks = scan_playlist(&playlist.music_dir, &playlist.extensions)?;
        if tracks.is_empty() {
            return Err(MurmurError::Media(format!(
                "no tracks under {}",
                playlist.music_dir.display()
            )));
        }
        Self::new(
            output,
            tracks,
            playlist.loop_playlist,
            audio.initial_volume_db,
        )
    }

    /// Subscribe to sink events.
    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn playlist(&self) -> &[PathBuf] {
        &self.inner.playlist
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SinkEvent) {
        let _ = self.inner.events.send(event);
    }

    // ── Playlist controls ────────────────────────────────────────────────

    /// Resume the playlist from the recorded offset. No-op if already playing.
    ///
    /// While a transient clip holds the output the request is deferred until
    /// the clip ends.
    ///
    /// # Errors
    ///
    /// `Media` for an empty playlist or unplayable track, `Device` when the
    /// output refuses to start. The sink is left stopped in both cases.
    pub fn play(&self) -> Result<()> {
        if self.inner.playlist.is_empty() {
            return Err(MurmurError::Media("playlist is empty".into()));
        }
        let mut st = self.lock();
        if st.transient.is_some() {
            debug!("playlist play deferred behind transient clip");
            st.playlist_active = true;
            st.resume_pending = true;
            return Ok(());
        }
        if st.loading || st.track.as_ref().is_some_and(|v| !v.is_finished()) {
            return Ok(());
        }
        self.stop_track(&mut st, false);
        if st.finished {
            st.finished = false;
            st.index = 0;
            st.offset = Duration::ZERO;
            st.clip = None;
        }
        st.playlist_active = true;
        self.start_track(st)
    }

    /// Stop output and remember the position. Marks the playlist inactive.
    pub fn pause(&self) {
        let mut st = self.lock();
        st.playlist_active = false;
        st.resume_pending = false;
        st.displaced = false;
        if let Some(slot) = st.transient.as_mut() {
            slot.resume_playlist = false;
        }
        if st.track.is_none() && !st.loading {
            return;
        }
        self.stop_track(&mut st, true);
        st.paused = true;
        info!(
            index = st.index,
            offset_ms = st.offset.as_millis() as u64,
            "playlist paused"
        );
        let event = SinkEvent::Paused {
            index: st.index,
            offset: st.offset,
        };
        drop(st);
        self.emit(event);
    }

    /// Stop output and rewind the current track. Marks the playlist inactive.
    ///
    /// A transient clip, if any, keeps playing.
    pub fn stop(&self) {
        self.stop_locked(self.lock());
    }

    /// [`stop`](Self::stop) on behalf of `owner`, skipped when the scheduler
    /// has since handed the sink to another task. Returns whether it stopped.
    pub fn stop_for(&self, owner: TaskId) -> bool {
        let st = self.lock();
        if st.owner.is_some_and(|o| o != owner) {
            debug!(task_id = %owner, "sink owned by another task, not stopping");
            return false;
        }
        self.stop_locked(st);
        true
    }

    fn stop_locked(&self, mut st: MutexGuard<'_, SinkState>) {
        st.playlist_active = false;
        st.resume_pending = false;
        st.displaced = false;
        if let Some(slot) = st.transient.as_mut() {
            slot.resume_playlist = false;
        }
        self.stop_track(&mut st, false);
        st.offset = Duration::ZERO;
        st.paused = false;
        drop(st);
        info!("playlist stopped");
        self.emit(SinkEvent::Stopped);
    }

    /// Skip to the next track and start it.
    ///
    /// # Errors
    ///
    /// Same as [`play`](Self::play).
    pub fn next(&self) -> Result<()> {
        self.step(1)
    }

    /// Go back to the previous track and start it.
    ///
    /// # Errors
    ///
    /// Same as [`play`](Self::play).
    pub fn prev(&self) -> Result<()> {
        self.step(-1)
    }

    fn step(&self, delta: isize) -> Result<()> {
        let len = self.inner.playlist.len();
        if len == 0 {
            return Err(MurmurError::Media("playlist is empty".into()));
        }
        let mut st = self.lock();
        self.stop_track(&mut st, false);
        st.index = (st.index as isize + delta).rem_euclid(len as isize) as usize;
        st.offset = Duration::ZERO;
        st.clip = None;
        st.paused = false;
        st.finished = false;
        st.playlist_active = true;
        if st.transient.is_some() {
            st.resume_pending = true;
            return Ok(());
        }
        self.start_track(st)
    }

    /// Adjust gain by `delta_db` and restart output at the current position.
    ///
    /// Returns the new gain.
    ///
    /// # Errors
    ///
    /// Same as [`play`](Self::play) when restarting fails.
    pub fn set_volume(&self, delta_db: f32) -> Result<f32> {
        let mut st = self.lock();
        st.volume_db += delta_db;
        let volume_db = st.volume_db;
        info!(volume_db, "volume changed");
        // A track still loading picks the new gain up when it starts.
        let result = if st.track.is_some() {
            self.stop_track(&mut st, true);
            self.start_track(st)
        } else {
            drop(st);
            Ok(())
        };
        self.emit(SinkEvent::VolumeChanged { volume_db });
        result.map(|()| volume_db)
    }

    // ── Transient clips ──────────────────────────────────────────────────

    /// Play a one-shot clip, displacing the playlist for its duration.
    ///
    /// `was_active_before` must be sampled by the caller before any sink
    /// mutation. The playlist is restarted afterwards only when both
    /// `resume_after` and `was_active_before` hold (or a play request was
    /// deferred during the clip). A failed load or start still honours that
    /// resumption. A cancelled clip leaves the playlist stopped.
    ///
    /// # Errors
    ///
    /// `Media`/`Device` on load/start failure, `Cancelled` when `cancel` fires.
    pub async fn play_transient(
        &self,
        path: &Path,
        was_active_before: bool,
        resume_after: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wants_resume = resume_after && was_active_before;
        debug!(clip = %path.display(), was_active_before, resume_after, "transient requested");

        let output = Arc::clone(&self.inner.output);
        let owned = path.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || output.load(&owned))
            .await
            .map_err(|e| MurmurError::Media(format!("clip loader panicked: {e}")))
            .and_then(|r| r);
        let clip = match loaded {
            Ok(clip) => clip,
            Err(e) => {
                warn!(clip = %path.display(), "transient clip unplayable: {e}");
                self.restore_playlist(wants_resume).await;
                return Err(e);
            }
        };

        let id = self.inner.next_transient_id.fetch_add(1, Ordering::Relaxed);
        let started = {
            let mut st = self.lock();
            if st.loading || st.track.as_ref().is_some_and(|v| !v.is_finished()) {
                st.displaced = true;
            }
            if st.track.is_some() || st.loading {
                self.stop_track(&mut st, true);
                st.paused = true;
            }
            st.playlist_active = false;
            if let Some(mut prev) = st.transient.take() {
                prev.voice.stop();
            }
            match self.inner.output.start(&clip, Duration::ZERO, st.volume_db) {
                Ok(voice) => {
                    st.transient = Some(TransientSlot {
                        id,
                        path: clip.path.clone(),
                        voice,
                        resume_playlist: wants_resume,
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = started {
            warn!(clip = %path.display(), "transient clip failed to start: {e}");
            self.restore_playlist(wants_resume).await;
            return Err(e);
        }
        let _guard = TransientGuard { sink: self, id };
        info!(clip = %clip.name(), duration_ms = clip.duration.as_millis() as u64, "transient playing");
        self.emit(SinkEvent::TransientStarted {
            path: clip.path.clone(),
        });

        let mut cancelled = tokio::select! {
            biased;
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(clip.duration) => false,
        };
        if !cancelled {
            let drain_deadline = Instant::now() + TRANSIENT_DRAIN_GRACE;
            while !self.transient_drained(id) && Instant::now() < drain_deadline {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    () = tokio::time::sleep(TRANSIENT_POLL) => {}
                }
            }
        }

        let resume = {
            let mut st = self.lock();
            let Some(mut slot) = st.transient.take_if(|t| t.id == id) else {
                // Superseded by a newer clip, which now owns resumption.
                return if cancelled {
                    Err(MurmurError::Cancelled)
                } else {
                    Ok(())
                };
            };
            slot.voice.stop();
            if cancelled {
                st.resume_pending = false;
                false
            } else {
                let pending = std::mem::take(&mut st.resume_pending);
                slot.resume_playlist || pending
            }
        };
        self.emit(SinkEvent::TransientFinished {
            path: clip.path.clone(),
            interrupted: cancelled,
        });

        if cancelled {
            info!(clip = %clip.name(), "transient interrupted");
            return Err(MurmurError::Cancelled);
        }
        debug!(clip = %clip.name(), resume, "transient done");
        if resume {
            self.blocking(|sink| sink.play()).await?;
        }
        Ok(())
    }

    /// Drop the transient slot `id` if it is still installed.
    fn discard_transient(&self, id: u64) {
        let mut st = self.lock();
        if let Some(mut slot) = st.transient.take_if(|t| t.id == id) {
            slot.voice.stop();
            st.resume_pending = false;
            debug!(clip = %slot.path.display(), "transient discarded");
        }
    }

    fn transient_drained(&self, id: u64) -> bool {
        let st = self.lock();
        st.transient
            .as_ref()
            .is_none_or(|t| t.id != id || t.voice.is_finished())
    }

    /// Restart the playlist after a failed transient when it was audible before.
    pub async fn restore_playlist(&self, was_active_before: bool) {
        if !was_active_before {
            return;
        }
        if let Err(e) = self.blocking(|sink| sink.play()).await {
            warn!("cannot restore playlist: {e}");
        }
    }

    /// Stop every voice (playlist and transient) without touching the offset
    /// bookkeeping of a paused playlist.
    pub fn silence(&self) {
        let mut st = self.lock();
        if let Some(mut slot) = st.transient.take() {
            slot.voice.stop();
        }
        st.resume_pending = false;
        if st.track.is_some() || st.loading {
            self.stop_track(&mut st, true);
            st.paused = true;
        }
        st.playlist_active = false;
    }

    // ── Ownership ────────────────────────────────────────────────────────

    /// Record `owner` as the task now driving the sink.
    pub fn claim(&self, owner: TaskId) {
        self.lock().owner = Some(owner);
    }

    /// Forget `owner` if it still holds the sink.
    pub fn release(&self, owner: TaskId) {
        let mut st = self.lock();
        if st.owner == Some(owner) {
            st.owner = None;
        }
    }

    /// Task the sink was last handed to, if it still holds it.
    pub fn owner(&self) -> Option<TaskId> {
        self.lock().owner
    }

    /// Run a blocking sink operation on the blocking pool.
    ///
    /// # Errors
    ///
    /// Propagates the operation's error, or `Device` if it panicked.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AudioSink) -> Result<T> + Send + 'static,
    {
        let sink = self.clone();
        tokio::task::spawn_blocking(move || op(&sink))
            .await
            .map_err(|e| MurmurError::Device(format!("sink operation panicked: {e}")))?
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    /// A playlist track is audibly playing.
    pub fn is_playing(&self) -> bool {
        self.lock().track.as_ref().is_some_and(|v| !v.is_finished())
    }

    /// Whether a transient enqueued now should restore the playlist afterwards.
    pub fn active_before_transient(&self) -> bool {
        let st = self.lock();
        Self::audible_or_pending(&st)
    }

    /// Whether the playlist is audible or only held off by a transient clip.
    ///
    /// A suspended playlist task samples this before releasing the sink to
    /// decide whether to restart playback when it resumes.
    pub fn wants_playlist(&self) -> bool {
        let st = self.lock();
        Self::audible_or_pending(&st) || st.displaced
    }

    fn audible_or_pending(st: &SinkState) -> bool {
        st.loading
            || st.track.as_ref().is_some_and(|v| !v.is_finished())
            || st.resume_pending
            || st.transient.as_ref().is_some_and(|t| t.resume_playlist)
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        let st = self.lock();
        let position = match st.track {
            Some(ref voice) => st.offset + voice.elapsed(),
            None => st.offset,
        };
        SinkSnapshot {
            track_index: st.index,
            track: self
                .inner
                .playlist
                .get(st.index)
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            position_ms: position.as_millis() as u64,
            volume_db: st.volume_db,
            is_playing: st.track.as_ref().is_some_and(|v| !v.is_finished()),
            paused: st.paused,
            playlist_active: st.playlist_active,
            transient_active: st.transient.is_some(),
            finished: st.finished,
            active_before_transient: Self::audible_or_pending(&st),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Stop the playlist voice and disarm the track timer.
    fn stop_track(&self, st: &mut SinkState, keep_position: bool) {
        st.timer = None;
        st.generation += 1;
        st.loading = false;
        if let Some(mut voice) = st.track.take() {
            voice.stop();
            if keep_position {
                st.offset += voice.elapsed();
            }
        }
    }

    /// Start the playlist voice at `st.offset`. Leaves the sink stopped on error.
    ///
    /// An uncached track is decoded with the lock released. Any control call
    /// that stops the track meanwhile supersedes the start, which then
    /// returns `Ok` without installing a voice.
    fn start_track<'a>(&'a self, mut st: MutexGuard<'a, SinkState>) -> Result<()> {
        let path = self.inner.playlist[st.index].clone();
        let clip = match st.clip.take() {
            Some(clip) if clip.path == path => clip,
            _ => {
                st.generation += 1;
                st.loading = true;
                let claim = st.generation;
                drop(st);
                let loaded = self.inner.output.load(&path);
                st = self.lock();
                if st.generation != claim {
                    debug!(track = %path.display(), "track start superseded while loading");
                    if let Ok(clip) = loaded {
                        let current = self.inner.playlist.get(st.index);
                        if st.clip.is_none() && current == Some(&clip.path) {
                            st.clip = Some(clip);
                        }
                    }
                    return Ok(());
                }
                st.loading = false;
                match loaded {
                    Ok(clip) => clip,
                    Err(e) => {
                        warn!(track = %path.display(), "track unplayable: {e}");
                        st.playlist_active = false;
                        st.offset = Duration::ZERO;
                        return Err(e);
                    }
                }
            }
        };
        if st.offset >= clip.duration {
            st.offset = Duration::ZERO;
        }

        let voice = match self.inner.output.start(&clip, st.offset, st.volume_db) {
            Ok(voice) => voice,
            Err(e) => {
                warn!(track = %clip.name(), "output refused track: {e}");
                st.clip = Some(clip);
                st.playlist_active = false;
                return Err(e);
            }
        };

        st.generation += 1;
        let generation = st.generation;
        let remaining = clip.duration.saturating_sub(st.offset);
        let weak: Weak<SinkInner> = Arc::downgrade(&self.inner);
        st.timer = Some(TrackTimer::arm(&self.inner.runtime, remaining, move || {
            if let Some(inner) = weak.upgrade() {
                AudioSink { inner }.on_track_end(generation);
            }
        }));

        info!(
            index = st.index,
            of = self.inner.playlist.len(),
            track = %clip.name(),
            offset_ms = st.offset.as_millis() as u64,
            "now playing"
        );
        self.emit(SinkEvent::TrackStarted {
            index: st.index,
            name: clip.name(),
            offset: st.offset,
        });
        st.track = Some(voice);
        st.clip = Some(clip);
        st.paused = false;
        st.finished = false;
        st.displaced = false;
        Ok(())
    }

    /// Track-end notification from the timer armed for `generation`.
    fn on_track_end(&self, generation: u64) {
        let mut st = self.lock();
        if st.generation != generation || st.track.is_none() || st.paused {
            debug!(generation, "stale track-end notification ignored");
            return;
        }
        self.stop_track(&mut st, false);
        st.offset = Duration::ZERO;
        st.clip = None;

        let len = self.inner.playlist.len();
        if self.inner.loop_playlist || st.index + 1 < len {
            st.index = (st.index + 1) % len;
            if let Err(e) = self.start_track(st) {
                warn!("playlist halted: {e}");
            }
        } else {
            info!("playlist finished");
            st.index = 0;
            st.playlist_active = false;
            st.finished = true;
            drop(st);
            self.emit(SinkEvent::PlaylistFinished);
        }
    }
}

/// Clears a transient slot when its `play_transient` future is dropped early.
struct TransientGuard<'a> {
    sink: &'a AudioSink,
    id: u64,
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        self.sink.discard_transient(self.id);
    }
}

/// Sorted list of files in `dir` whose extension is in `extensions`.
///
/// # Errors
///
/// Returns `Media` when the directory cannot be read.
pub fn scan_playlist(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| MurmurError::Media(format!("cannot read {}: {e}", dir.display())))?;
    let mut tracks: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
        })
        .collect();
    tracks.sort();
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::silent::SilentOutput;
    use crate::test_utils::{playlist_dir, write_tone_wav};

    fn sink_over(
        dir: &Path,
        lengths: &[Duration],
        loop_playlist: bool,
    ) -> (AudioSink, SilentOutput) {
        let tracks = playlist_dir(dir, lengths);
        let output = SilentOutput::new();
        let sink = AudioSink::new(Arc::new(output.clone()), tracks, loop_playlist, 0.0).unwrap();
        (sink, output)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_accumulates_and_play_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);

        sink.play().unwrap();
        assert!(sink.is_playing());
        tokio::time::sleep(Duration::from_millis(120)).await;
        sink.pause();

        let snap = sink.snapshot();
        assert!(!snap.is_playing);
        assert!(snap.paused);
        assert!(!snap.playlist_active);
        assert!(snap.position_ms >= 120);

        sink.play().unwrap();
        let starts = output.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].offset.as_millis() as u64, snap.position_ms);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn play_is_noop_while_playing() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        sink.play().unwrap();
        sink.play().unwrap();
        assert_eq!(output.starts().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.stop();
        let snap = sink.snapshot();
        assert_eq!(snap.position_ms, 0);
        assert!(!snap.playlist_active);
        assert!(!snap.paused);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn next_and_prev_wrap_around() {
        let dir = tempfile::tempdir().unwrap();
        let lengths = [Duration::from_secs(5); 3];
        let (sink, _output) = sink_over(dir.path(), &lengths, true);

        sink.prev().unwrap();
        assert_eq!(sink.snapshot().track_index, 2);
        sink.next().unwrap();
        assert_eq!(sink.snapshot().track_index, 0);
        sink.next().unwrap();
        let snap = sink.snapshot();
        assert_eq!(snap.track_index, 1);
        assert!(snap.is_playing);
        assert!(snap.playlist_active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn track_end_advances_when_looping() {
        let dir = tempfile::tempdir().unwrap();
        let lengths = [Duration::from_millis(150), Duration::from_secs(5)];
        let (sink, _output) = sink_over(dir.path(), &lengths, true);
        let mut events = sink.subscribe();

        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(sink.snapshot().track_index, 1);

        let mut started = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let SinkEvent::TrackStarted { index, .. } = ev {
                started.push(index);
            }
        }
        assert_eq!(started, vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paused_track_does_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let lengths = [Duration::from_millis(200), Duration::from_secs(5)];
        let (sink, _output) = sink_over(dir.path(), &lengths, true);

        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.pause();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let snap = sink.snapshot();
        assert_eq!(snap.track_index, 0);
        assert!(snap.paused);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_looping_playlist_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let lengths = [Duration::from_millis(100), Duration::from_millis(100)];
        let (sink, _output) = sink_over(dir.path(), &lengths, false);

        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snap = sink.snapshot();
        assert!(snap.finished);
        assert!(!snap.is_playing);
        assert!(!snap.playlist_active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn volume_restarts_at_current_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let db = sink.set_volume(-3.0).unwrap();
        assert_eq!(db, -3.0);

        let starts = output.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].gain_db, -3.0);
        assert!(starts[1].offset >= Duration::from_millis(80));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_resumes_playlist_when_it_was_active() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        let chime = dir.path().join("chime.wav");
        write_tone_wav(&chime, Duration::from_millis(100));

        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let was_active = sink.active_before_transient();
        assert!(was_active);

        sink.play_transient(&chime, was_active, true, &CancellationToken::new())
            .await
            .unwrap();

        let snap = sink.snapshot();
        assert!(snap.is_playing);
        let starts = output.starts();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[1].path, chime);
        assert!(starts[2].offset >= Duration::from_millis(60));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_does_not_start_idle_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        let chime = dir.path().join("chime.wav");
        write_tone_wav(&chime, Duration::from_millis(80));

        let was_active = sink.active_before_transient();
        assert!(!was_active);
        sink.play_transient(&chime, was_active, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!sink.snapshot().is_playing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_clip_still_restores_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        sink.play().unwrap();
        sink.pause();

        let err = sink
            .play_transient(
                &dir.path().join("nope.mp3"),
                true,
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MurmurError::Media(_)));
        assert!(sink.snapshot().is_playing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_transient_leaves_sink_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        let clip = dir.path().join("long.wav");
        write_tone_wav(&clip, Duration::from_secs(5));

        sink.play().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            trigger.cancel();
        });
        let err = sink.play_transient(&clip, true, true, &cancel).await.unwrap_err();
        assert!(matches!(err, MurmurError::Cancelled));

        let snap = sink.snapshot();
        assert!(!snap.is_playing);
        assert!(!snap.transient_active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn play_during_transient_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        let clip = dir.path().join("clip.wav");
        write_tone_wav(&clip, Duration::from_millis(150));

        let bg = sink.clone();
        let handle = tokio::spawn(async move {
            bg.play_transient(&clip, false, false, &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.play().unwrap();
        assert!(!sink.is_playing());
        assert!(sink.active_before_transient());

        handle.await.unwrap().unwrap();
        assert!(sink.is_playing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_failure_leaves_sink_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        output.set_device_failure(true);
        assert!(matches!(sink.play(), Err(MurmurError::Device(_))));
        assert!(!sink.snapshot().playlist_active);

        output.set_device_failure(false);
        sink.play().unwrap();
        assert!(sink.is_playing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshots_do_not_wait_for_track_decode() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        output.set_load_delay(Duration::from_millis(400));

        let bg = sink.clone();
        let play = tokio::spawn(async move { bg.blocking(|s| s.play()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let asked = Instant::now();
        let snap = sink.snapshot();
        assert!(asked.elapsed() < Duration::from_millis(150));
        assert!(!snap.is_playing);
        assert!(snap.active_before_transient);
        assert!(sink.wants_playlist());

        play.await.unwrap().unwrap();
        assert!(sink.is_playing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_during_decode_cancels_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, output) = sink_over(dir.path(), &[Duration::from_secs(10)], true);
        output.set_load_delay(Duration::from_millis(200));

        let bg = sink.clone();
        let play = tokio::spawn(async move { bg.blocking(|s| s.play()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.pause();
        play.await.unwrap().unwrap();

        let snap = sink.snapshot();
        assert!(!snap.is_playing);
        assert!(!snap.playlist_active);
        assert!(output.starts().is_empty());

        output.set_load_delay(Duration::ZERO);
        sink.play().unwrap();
        assert!(sink.is_playing());
        assert_eq!(output.starts().len(), 1);
    }

    #[test]
    fn scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_tone_wav(&dir.path().join("b.wav"), Duration::from_millis(10));
        write_tone_wav(&dir.path().join("a.WAV"), Duration::from_millis(10));
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let tracks = scan_playlist(dir.path(), &["wav".to_owned()]).unwrap();
        let names: Vec<_> = tracks
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.WAV", "b.wav"]);
    }

    #[test]
    fn sink_requires_runtime() {
        let result = AudioSink::new(Arc::new(SilentOutput::new()), Vec::new(), true, 0.0);
        assert!(matches!(result, Err(MurmurError::Config(_))));
    }
}
