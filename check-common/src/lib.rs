//! Shared building blocks for the asynchronous batch-check service: the
//! snippet/result data model, the task queue, and the jobs backend that the
//! HTTP API and the worker both talk to.

pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod queue;
pub mod types;
