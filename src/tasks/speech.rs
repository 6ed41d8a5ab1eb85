//! Synthesized speech read-out (replies, reminders, time/weather reports).

use crate::error::{MurmurError, Result};
use crate::speech::{StaticText, Synthesizer, TextSource};
use crate::task::{TaskBody, TaskContext, TaskKind};
use crate::tasks::bounded;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_SYNTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches text, synthesizes it and plays it as a transient clip.
///
/// Non-resumable: a synthesized utterance cannot be continued mid-stream.
pub struct SpeechTask {
    source: Box<dyn TextSource>,
    synth: Arc<dyn Synthesizer>,
    synth_timeout: Duration,
    was_active_before: bool,
    resume_after: bool,
}

impl SpeechTask {
    /// Speak a fixed text.
    pub fn new(text: impl Into<String>, synth: Arc<dyn Synthesizer>, was_active_before: bool) -> Self {
        Self::from_source(StaticText(text.into()), synth, was_active_before)
    }

    /// Speak whatever `source` yields when the task runs.
    pub fn from_source(
        source: impl TextSource + 'static,
        synth: Arc<dyn Synthesizer>,
        was_active_before: bool,
    ) -> Self {
        Self {
            source: Box::new(source),
            synth,
            synth_timeout: DEFAULT_SYNTH_TIMEOUT,
            was_active_before,
            resume_after: true,
        }
    }

    /// Budget for fetching and for synthesizing the text, each.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.synth_timeout = timeout;
        self
    }

    pub fn resume_after(mut self, resume: bool) -> Self {
        self.resume_after = resume;
        self
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<Option<PathBuf>> {
        let text = bounded(ctx, self.synth_timeout, "text source", self.source.fetch()).await?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        debug!(chars = text.len(), "speech text ready");
        bounded(ctx, self.synth_timeout, "speech synthesis", self.synth.synthesize(text))
            .await
            .map(Some)
    }
}

#[async_trait]
impl TaskBody for SpeechTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Speech
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let wants_resume = self.resume_after && self.was_active_before;
        let clip = match self.prepare(ctx).await {
            Ok(Some(clip)) => clip,
            Ok(None) => {
                debug!("nothing to say");
                ctx.sink().restore_playlist(wants_resume).await;
                return Ok(());
            }
            Err(MurmurError::Cancelled) => return Err(MurmurError::Cancelled),
            Err(e) => {
                warn!("speech not produced: {e}");
                ctx.sink().restore_playlist(wants_resume).await;
                return Err(e);
            }
        };

        let played = ctx
            .sink()
            .play_transient(
                &clip,
                self.was_active_before,
                self.resume_after,
                ctx.cancel_token(),
            )
            .await;
        self.synth.discard(&clip).await;
        played
    }
}
