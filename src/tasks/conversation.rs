//! Streamed conversational reply.

use crate::error::{MurmurError, Result};
use crate::scheduler::events::SchedulerEvent;
use crate::speech::{ReplyStream, Synthesizer};
use crate::task::{TaskBody, TaskContext, TaskKind};
use crate::tasks::bounded;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_SYNTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Speaks a reply chunk by chunk as it streams in.
///
/// Cancellable mid-chunk; never resumable. The playlist is restarted at the
/// end only when `resume_playlist` is set and it was active before.
pub struct ConversationTask {
    replies: Box<dyn ReplyStream>,
    synth: Arc<dyn Synthesizer>,
    chunk_timeout: Duration,
    synth_timeout: Duration,
    was_active_before: bool,
    resume_playlist: bool,
}

impl ConversationTask {
    pub fn new(
        replies: impl ReplyStream + 'static,
        synth: Arc<dyn Synthesizer>,
        was_active_before: bool,
    ) -> Self {
        Self {
            replies: Box::new(replies),
            synth,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            synth_timeout: DEFAULT_SYNTH_TIMEOUT,
            was_active_before,
            resume_playlist: false,
        }
    }

    pub fn with_timeouts(mut self, chunk: Duration, synth: Duration) -> Self {
        self.chunk_timeout = chunk;
        self.synth_timeout = synth;
        self
    }

    pub fn resume_playlist(mut self, resume: bool) -> Self {
        self.resume_playlist = resume;
        self
    }

    async fn speak_all(&mut self, ctx: &TaskContext, spoken: &mut Vec<String>) -> Result<()> {
        loop {
            let chunk = bounded(ctx, self.chunk_timeout, "reply chunk", self.replies.next_chunk()).await?;
            let Some(text) = chunk else {
                return Ok(());
            };
            let text = text.trim().to_owned();
            if text.is_empty() {
                continue;
            }

            let clip = bounded(ctx, self.synth_timeout, "speech synthesis", self.synth.synthesize(&text)).await?;
            debug!(chunk = spoken.len(), chars = text.len(), "speaking reply chunk");
            let played = ctx
                .sink()
                .play_transient(&clip, false, false, ctx.cancel_token())
                .await;
            self.synth.discard(&clip).await;
            played?;
            spoken.push(text);
        }
    }
}

#[async_trait]
impl TaskBody for ConversationTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Conversation
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let wants_resume = self.resume_playlist && self.was_active_before;
        let mut spoken = Vec::new();
        let outcome = self.speak_all(ctx, &mut spoken).await;

        if !spoken.is_empty() {
            ctx.publish(SchedulerEvent::Reply {
                task_id: ctx.meta().id,
                text: spoken.join(" "),
                complete: outcome.is_ok(),
            });
        }

        match outcome {
            Ok(()) => {
                info!(chunks = spoken.len(), "reply finished");
                ctx.sink().restore_playlist(wants_resume).await;
                Ok(())
            }
            Err(MurmurError::Cancelled) => Err(MurmurError::Cancelled),
            Err(e) => {
                warn!(chunks = spoken.len(), "reply aborted: {e}");
                ctx.sink().restore_playlist(wants_resume).await;
                Err(e)
            }
        }
    }
}
