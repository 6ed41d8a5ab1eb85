//! Speech collaborators: synthesis, text providers and streamed replies.
//!
//! The scheduler core never reaches into these; tasks receive them at
//! construction time.

use crate::config::SpeechConfig;
use crate::error::{MurmurError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::sync::mpsc;
use tracing::debug;

/// Renders text to a playable audio file.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// # Errors
    ///
    /// Returns `Collaborator` when synthesis fails.
    async fn synthesize(&self, text: &str) -> Result<PathBuf>;

    /// Release a clip returned by [`synthesize`](Self::synthesize) once played.
    async fn discard(&self, _clip: &Path) {}
}

/// Supplies the text of a read-out at execution time (weather, time, ...).
#[async_trait]
pub trait TextSource: Send + Sync {
    /// # Errors
    ///
    /// Returns `Collaborator` when the text cannot be produced.
    async fn fetch(&self) -> Result<String>;
}

/// Chunks of a streamed conversational reply.
#[async_trait]
pub trait ReplyStream: Send {
    /// Next spoken chunk, or `None` at the end of the reply.
    ///
    /// # Errors
    ///
    /// Returns `Collaborator` when the upstream fails mid-reply.
    async fn next_chunk(&mut self) -> Result<Option<String>>;
}

/// Synthesizer that shells out to an external command.
///
/// `{text}` and `{out}` in the argv are replaced by the text to speak and
/// the path of the WAV file the command must write.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    argv: Vec<String>,
    out_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(argv: Vec<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            out_dir: out_dir.into(),
        }
    }

    /// Build from `[speech]`. Returns `None` when no command is configured.
    pub fn from_config(config: &SpeechConfig) -> Option<Self> {
        if config.synth_command.is_empty() {
            return None;
        }
        Some(Self::new(
            config.synth_command.clone(),
            config.cache_dir.join("speech"),
        ))
    }

    fn expand(&self, text: &str, out: &Path) -> Vec<String> {
        let out = out.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace("{text}", text).replace("{out}", &out))
            .collect()
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let out = self
            .out_dir
            .join(format!("speech-{}.wav", uuid::Uuid::new_v4().simple()));
        let argv = self.expand(text, &out);
        let Some((program, args)) = argv.split_first() else {
            return Err(MurmurError::Config("synth_command is empty".into()));
        };

        debug!(program = %program, chars = text.len(), "synthesizing");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MurmurError::Collaborator(format!("cannot run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MurmurError::Collaborator(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if !tokio::fs::try_exists(&out).await.unwrap_or(false) {
            return Err(MurmurError::Collaborator(format!(
                "{program} did not write {}",
                out.display()
            )));
        }
        Ok(out)
    }

    async fn discard(&self, clip: &Path) {
        if let Err(e) = tokio::fs::remove_file(clip).await {
            debug!(clip = %clip.display(), "cannot remove synthesized clip: {e}");
        }
    }
}

/// Fixed text, for read-outs known at enqueue time.
#[derive(Debug, Clone)]
pub struct StaticText(pub String);

#[async_trait]
impl TextSource for StaticText {
    async fn fetch(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reply stream fed through a channel by an upstream producer.
#[derive(Debug)]
pub struct ChannelReplies {
    rx: mpsc::Receiver<Result<String>>,
}

impl ChannelReplies {
    /// Create the stream and the sender the upstream writes chunks to.
    ///
    /// Dropping the sender ends the reply.
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<String>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl ReplyStream for Box<dyn ReplyStream> {
    async fn next_chunk(&mut self) -> Result<Option<String>> {
        (**self).next_chunk().await
    }
}

#[async_trait]
impl ReplyStream for ChannelReplies {
    async fn next_chunk(&mut self) -> Result<Option<String>> {
        self.rx.recv().await.transpose()
    }
}
