//! Background music playlist task.

use crate::audio::SinkEvent;
use crate::error::{MurmurError, Result};
use crate::task::{Signal, TaskBody, TaskContext, TaskKind};
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Plays the sink's playlist until cancelled or, with looping disabled,
/// until the last track ends. The only built-in resumable task.
#[derive(Debug, Default)]
pub struct PlaylistTask {
    _private: (),
}

impl PlaylistTask {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBody for PlaylistTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Playlist
    }

    fn resumable(&self) -> bool {
        true
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let sink = ctx.sink();
        let mut sink_events = sink.subscribe();
        sink.blocking(|s| s.play()).await?;

        loop {
            let signal = tokio::select! {
                signal = ctx.next_signal() => signal,
                event = sink_events.recv() => match event {
                    Ok(SinkEvent::PlaylistFinished) => {
                        info!("playlist exhausted");
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "playlist task lagged behind sink events");
                        if sink.snapshot().finished {
                            info!("playlist exhausted");
                            return Ok(());
                        }
                        continue;
                    }
                    Err(RecvError::Closed) => ctx.next_signal().await,
                },
            };
            match signal {
                Signal::Continue => {}
                Signal::Pause => {
                    let wanted = sink.wants_playlist();
                    sink.blocking(|s| {
                        s.pause();
                        Ok(())
                    })
                    .await?;
                    debug!(
                        offset_ms = sink.snapshot().position_ms,
                        restart = wanted,
                        "playlist suspended"
                    );
                    if let Err(e) = ctx.wait_resumed().await {
                        stop(ctx).await?;
                        return Err(e);
                    }
                    if wanted {
                        sink.blocking(|s| s.play()).await?;
                    }
                }
                Signal::Cancel => {
                    stop(ctx).await?;
                    return Err(MurmurError::Cancelled);
                }
            }
        }
    }
}

async fn stop(ctx: &TaskContext) -> Result<()> {
    ctx.sink()
        .blocking(|s| {
            s.stop();
            Ok(())
        })
        .await
}
