//! Durable scheduling: the pulse event queue with at-most-once claims, the
//! cron expression planner, and the worker/planner engine with graceful
//! drain on shutdown.

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod pulse;
pub mod types;

pub use cron::CronExpr;
pub use engine::{PulseHandler, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use pulse::PulseQueue;
pub use types::{CronJob, PulseEvent, PulseState};
