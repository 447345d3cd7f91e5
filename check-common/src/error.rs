use thiserror::Error;

/// Enumeration of errors for operations on the task queue and jobs backend.
/// Errors that originate in the redis client or in serde are wrapped to
/// provide additional context.
#[derive(Error, Debug)]
pub enum JobsError {
    #[error("backlog limit exceeded ({observed} > {limit})")]
    BacklogFull { observed: usize, limit: usize },
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("payload could not be encoded or decoded: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stored result payload must be a JSON object")]
    MalformedSlot,
    #[error("{0} is not a valid job status")]
    ParseJobStatus(String),
    #[error("LEAN_SERVER_REDIS_URL must be configured when the durable backend is enabled")]
    MissingRedisUrl,
}

impl JobsError {
    /// Whether this error is the admission-control refusal. Callers surface
    /// it differently (HTTP 429) from genuine backend failures.
    pub fn is_backlog_full(&self) -> bool {
        matches!(self, JobsError::BacklogFull { .. })
    }
}
