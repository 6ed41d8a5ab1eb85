//! Built-in task bodies.

pub mod clip;
pub mod conversation;
pub mod playlist;
pub mod speech;

pub use clip::ClipTask;
pub use conversation::ConversationTask;
pub use playlist::PlaylistTask;
pub use speech::SpeechTask;

use crate::error::{MurmurError, Result};
use crate::task::TaskContext;
use std::future::Future;
use std::time::Duration;

/// Run a collaborator step under `budget`, giving up early on cancel.
///
/// # Errors
///
/// `Timeout` when the budget runs out, `Cancelled` when the task is
/// cancelled, otherwise the step's own error.
pub(crate) async fn bounded<T>(
    ctx: &TaskContext,
    budget: Duration,
    what: &str,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(MurmurError::Cancelled),
        res = tokio::time::timeout(budget, step) => match res {
            Ok(inner) => inner,
            Err(_) => Err(MurmurError::Timeout(format!(
                "{what} exceeded {}ms",
                budget.as_millis()
            ))),
        },
    }
}
