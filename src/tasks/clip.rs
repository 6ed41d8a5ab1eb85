//! One-shot pre-rendered clip, e.g. the wake confirmation chime.

use crate::error::Result;
use crate::task::{TaskBody, TaskContext, TaskKind};
use async_trait::async_trait;
use std::path::PathBuf;

/// Plays one file as a transient clip.
#[derive(Debug, Clone)]
pub struct ClipTask {
    path: PathBuf,
    was_active_before: bool,
    resume_after: bool,
}

impl ClipTask {
    /// `was_active_before` must be sampled from the sink before enqueueing.
    pub fn new(path: impl Into<PathBuf>, was_active_before: bool) -> Self {
        Self {
            path: path.into(),
            was_active_before,
            resume_after: true,
        }
    }

    /// Whether to restart the playlist afterwards (default true).
    pub fn resume_after(mut self, resume: bool) -> Self {
        self.resume_after = resume;
        self
    }
}

#[async_trait]
impl TaskBody for ClipTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Clip
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.sink()
            .play_transient(
                &self.path,
                self.was_active_before,
                self.resume_after,
                ctx.cancel_token(),
            )
            .await
    }
}
