//! Worker side of the asynchronous batch-check service: drains the task
//! queue, invokes the external checker, and records per-task outcomes.

pub mod checker;
pub mod config;
pub mod error;
pub mod worker;
