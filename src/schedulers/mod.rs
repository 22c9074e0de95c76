//! Scheduling: the control loop that drives a routine to completion.
//!
//! [`scheduler`] holds the loop itself (seeding, readiness, bounded
//! concurrent dispatch, termination); [`dispatch`] is the glue between a
//! ready task and a running plugin future; [`successors`] computes what a
//! completion enqueues, including branch routing and loop re-entry.

pub mod dispatch;
pub mod scheduler;
pub mod successors;

pub use dispatch::{DispatchEnv, DispatchError};
pub use scheduler::{
    CancelToken, ExecutionCallbacks, Readiness, RunError, RunLimits, Scheduler, SchedulerOutcome,
    Task,
};
pub use successors::expand_successors;
