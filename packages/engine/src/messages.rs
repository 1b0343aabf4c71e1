//! Message types for actor communication.

use quarry_core::JobEvent;
use ractor::RpcReplyPort;
use tokio::sync::broadcast;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Look for work now.
    Poll,

    /// Shutdown the worker.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Periodic housekeeping: reclaim lapsed leases, release due retries,
    /// sweep waiting jobs.
    Tick,

    /// Subscribe to the event stream.
    Subscribe {
        reply: RpcReplyPort<broadcast::Receiver<JobEvent>>,
    },

    /// Publish an event to all subscribers.
    Broadcast { event: JobEvent },

    /// Shutdown all workers and the supervisor.
    Shutdown,
}
