//! Runtime for the quarry job queue.
//!
//! This crate provides the actor system that turns persisted jobs into
//! executed work:
//!
//! - `Supervisor` - spawns the worker pool and runs the housekeeping tick
//!   (lease reclamation, retry release, dependency sweep)
//! - `WorkerActor` - polls for work with idle backoff, executes handlers,
//!   renews its lease, and reports results
//! - `Scheduler` - priority-then-age claim ordering over the store
//! - `DependencyResolver` - promotes waiting jobs whose prerequisites
//!   completed
//!
//! Workers coordinate exclusively through the store's conditional updates;
//! the broadcast event channel is notification-only.

mod config;
mod handler;
mod messages;
mod resolver;
mod scheduler;
mod supervisor;
mod worker;

pub use config::EngineConfig;
pub use handler::{
    FnHandler, HandlerError, HandlerFuture, HandlerResult, JobContext, JobHandler,
    JobHandlerRegistry, ReportError,
};
pub use messages::{SupervisorMessage, WorkerMessage};
pub use resolver::DependencyResolver;
pub use scheduler::Scheduler;
pub use supervisor::{Supervisor, SupervisorArgs, start_engine};
pub use worker::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
