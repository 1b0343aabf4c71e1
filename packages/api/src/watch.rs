//! Per-job event streams.

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use quarry_core::{JobEvent, JobId};
use tokio::sync::broadcast;

use crate::{ApiError, Queue};

/// Stream of one job's events, ending at its terminal state.
pub type JobEventStream = BoxStream<'static, JobEvent>;

/// Build a lazy, restartable stream of events for `id`.
///
/// The subscription is taken before the job is inspected, so a terminal
/// transition between the two cannot be missed: either the snapshot already
/// shows a terminal state (empty stream) or the event arrives through the
/// subscription. Callers re-invoke to restart from the current state.
pub(crate) async fn watch(queue: &Queue, id: JobId) -> Result<JobEventStream, ApiError> {
    let rx = queue.subscribe().await?;
    let job = queue.job(id).await?;

    if job.is_terminal() {
        return Ok(stream::empty().boxed());
    }

    let stream = stream::unfold((rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == id => {
                    let done = event.is_terminal();
                    return Some((event, (rx, done)));
                }
                Ok(_) => continue,
                // Slow consumers skip what they missed; the job record
                // itself is always available for a full picture.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(stream.boxed())
}
