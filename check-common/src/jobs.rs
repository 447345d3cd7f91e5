//! The jobs backend: the durable source of truth for job state, task
//! enqueue, result assembly, and poll.
//!
//! Two interchangeable implementations share one contract: [`RedisJobs`]
//! keeps job metadata in a redis hash and result slots in a fixed-length
//! redis list, with every multi-op mutation inside a MULTI/EXEC pipeline or
//! a Lua script; [`InMemoryJobs`] keeps plain maps under a single lock and
//! exists for tests and development.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::JobsError;
use crate::queue::{
    deserialize_result, now_iso, serialize_result, MemoryTaskQueue, RedisTaskQueue, TaskPayload,
    TaskQueue,
};
use crate::types::{CheckRequest, ReplResponse};

/// Lifecycle status of a job. `failed` is reserved for catastrophic
/// submit-time enqueue failure; per-task failures are recorded in result
/// slots and still complete the job.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }

    /// Terminal states are the only ones whose polls may carry results.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "expired" => Ok(JobStatus::Expired),
            invalid => Err(JobsError::ParseJobStatus(invalid.to_owned())),
        }
    }
}

/// Per-job progress counters. `done + failed + running <= total` at all
/// times; pollers may observe intermediate states.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Progress {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub running: u64,
}

/// Reply to a submit call.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub total_snippets: usize,
    pub queued_at: String,
    pub expires_at: String,
}

/// Reply to a poll call. `results` is only present once the job is terminal
/// and every slot has been written; it is ordered by the original snippet
/// index regardless of completion order.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PollResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The jobs backend contract shared by the HTTP service and the worker.
#[async_trait]
pub trait Jobs: Send + Sync {
    /// Admit a batch, persist its metadata and empty result slots, then
    /// enqueue one task per snippet. Fails with
    /// [`JobsError::BacklogFull`] when the queue depth plus the incoming
    /// batch would exceed the backlog limit (best-effort check, not atomic
    /// with the enqueue).
    async fn submit(&self, request: CheckRequest) -> Result<SubmitResponse, JobsError>;

    /// Read a job's status and progress; `None` for unknown or expired ids.
    async fn poll(&self, job_id: &str) -> Result<Option<PollResponse>, JobsError>;

    /// Blocking dequeue of the next task, delegating to the task queue.
    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError>;

    /// Flip the job to running and bump the running counter. A no-op
    /// warning when the job's metadata has expired (orphaned task).
    async fn mark_task_started(&self, task: &TaskPayload) -> Result<(), JobsError>;

    /// Write a success outcome into the task's result slot.
    async fn mark_task_success(
        &self,
        task: &TaskPayload,
        response: ReplResponse,
    ) -> Result<(), JobsError>;

    /// Write a failure outcome into the task's result slot.
    async fn mark_task_failure(
        &self,
        task: &TaskPayload,
        error: &str,
        snippet_id: &str,
    ) -> Result<(), JobsError>;

    /// Release underlying queue resources.
    async fn close(&self);
}

/// Settings consumed by [`create_jobs`]; both binaries derive one of these
/// from their environment config.
#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub redis_url: Option<String>,
    pub queue_name: String,
    pub key_prefix: String,
    pub result_ttl_sec: u64,
    pub backlog_limit: usize,
    pub use_in_memory_backend: bool,
}

/// Construct the configured jobs backend. The in-memory override wins;
/// otherwise a redis URL is required and the connection is established
/// eagerly so callers fail fast on an unreachable backend.
pub async fn create_jobs(settings: &JobsSettings) -> Result<Arc<dyn Jobs>, JobsError> {
    if settings.use_in_memory_backend {
        warn!(
            ttl_sec = settings.result_ttl_sec,
            backlog_limit = settings.backlog_limit,
            "jobs backend configured in-memory (non-durable)"
        );
        return Ok(Arc::new(InMemoryJobs::new(
            settings.result_ttl_sec,
            settings.backlog_limit,
        )));
    }

    let url = settings
        .redis_url
        .as_deref()
        .ok_or(JobsError::MissingRedisUrl)?;
    let client = redis::Client::open(url)?;
    let connection = client.get_multiplexed_async_connection().await?;
    // BLPOP blocks its connection for the duration of the wait, so the
    // queue gets a connection of its own.
    let queue_connection = client.get_multiplexed_async_connection().await?;
    let queue = RedisTaskQueue::new(queue_connection, settings.queue_name.clone());

    info!(
        queue = %settings.queue_name,
        key_prefix = %settings.key_prefix,
        ttl_sec = settings.result_ttl_sec,
        backlog_limit = settings.backlog_limit,
        "jobs backend configured on redis"
    );
    Ok(Arc::new(RedisJobs {
        connection,
        queue,
        queue_name: settings.queue_name.clone(),
        key_prefix: settings.key_prefix.clone(),
        ttl_sec: settings.result_ttl_sec,
        backlog_limit: settings.backlog_limit,
    }))
}

fn expires_iso(ttl_sec: u64) -> String {
    (Utc::now() + chrono::Duration::seconds(ttl_sec as i64))
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn fresh_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// Finalize one result slot. Runs as a single atomic unit so the slot write,
// the counter bumps, the completion status flip, and the TTL refresh cannot
// interleave with a poll.
//
// KEYS: 1. meta hash  2. results list
// ARGV: 1. slot index  2. serialized payload  3. "1" on failure
//       4. updated_at  5. ttl seconds
//
// Returns {done, failed, total}, or {-1, -1, -1} when the job's metadata no
// longer exists (orphaned task). A slot that is already non-empty is
// overwritten without advancing the counters, so a replayed delivery cannot
// double-count.
const FINALIZE_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return {-1, -1, -1}
    end
    local index = tonumber(ARGV[1])
    local previous = redis.call('LINDEX', KEYS[2], index)
    redis.call('LSET', KEYS[2], index, ARGV[2])
    if previous == false or previous == '' then
        local running = redis.call('HINCRBY', KEYS[1], 'running', -1)
        if running < 0 then
            redis.call('HSET', KEYS[1], 'running', '0')
        end
        if ARGV[3] == '1' then
            redis.call('HINCRBY', KEYS[1], 'failed', 1)
        else
            redis.call('HINCRBY', KEYS[1], 'done', 1)
        end
    end
    redis.call('HSET', KEYS[1], 'updated_at', ARGV[4])
    local done = tonumber(redis.call('HGET', KEYS[1], 'done') or '0')
    local failed = tonumber(redis.call('HGET', KEYS[1], 'failed') or '0')
    local total = tonumber(redis.call('HGET', KEYS[1], 'total') or '0')
    if done + failed >= total then
        redis.call('HSET', KEYS[1], 'status', 'completed')
    end
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
    redis.call('EXPIRE', KEYS[2], tonumber(ARGV[5]))
    return {done, failed, total}
"#;

static FINALIZE: Lazy<redis::Script> = Lazy::new(|| redis::Script::new(FINALIZE_SCRIPT));

/// The durable backend. Key layout: `<prefix>:job:<id>:meta` (hash),
/// `<prefix>:job:<id>:results` (list of length `total`), plus the shared
/// task list owned by [`RedisTaskQueue`]. Both job keys carry the same TTL
/// and every write refreshes both, extending the liveness of active jobs.
pub struct RedisJobs {
    connection: MultiplexedConnection,
    queue: RedisTaskQueue,
    queue_name: String,
    key_prefix: String,
    ttl_sec: u64,
    backlog_limit: usize,
}

impl RedisJobs {
    fn meta_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:meta", self.key_prefix, job_id)
    }

    fn results_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:results", self.key_prefix, job_id)
    }

    async fn read_meta(&self, job_id: &str) -> Result<Option<HashMap<String, String>>, JobsError> {
        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.meta_key(job_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(raw))
    }

    async fn finalize_slot(
        &self,
        task: &TaskPayload,
        payload: Value,
        is_failure: bool,
    ) -> Result<(), JobsError> {
        let meta_key = self.meta_key(&task.job_id);
        let results_key = self.results_key(&task.job_id);
        let serialized = serialize_result(&payload)?;
        let mut conn = self.connection.clone();

        let (done, failed, total): (i64, i64, i64) = FINALIZE
            .key(&meta_key)
            .key(&results_key)
            .arg(task.index)
            .arg(serialized)
            .arg(if is_failure { "1" } else { "0" })
            .arg(now_iso())
            .arg(self.ttl_sec)
            .invoke_async(&mut conn)
            .await?;

        if done < 0 {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                index = task.index,
                failure = is_failure,
                "result write ignored, job metadata is gone"
            );
            return Ok(());
        }

        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            index = task.index,
            snippet_id = %task.snippet.id,
            failure = is_failure,
            done,
            failed,
            total,
            "result stored"
        );
        if done + failed >= total {
            info!(job_id = %task.job_id, done, failed, total, "job completed");
        }
        Ok(())
    }
}

fn meta_u64(meta: &HashMap<String, String>, key: &str) -> u64 {
    meta.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl Jobs for RedisJobs {
    async fn submit(&self, request: CheckRequest) -> Result<SubmitResponse, JobsError> {
        let n = request.snippets.len();
        let queue_depth = self.queue.length().await?;
        info!(
            queue = %self.queue_name,
            depth = queue_depth,
            incoming = n,
            backlog_limit = self.backlog_limit,
            "submit preflight"
        );
        if queue_depth + n > self.backlog_limit {
            warn!(
                queue = %self.queue_name,
                depth = queue_depth,
                incoming = n,
                backlog_limit = self.backlog_limit,
                "submit rejected, backlog full"
            );
            return Err(JobsError::BacklogFull {
                observed: queue_depth + n,
                limit: self.backlog_limit,
            });
        }

        let job_id = fresh_job_id();
        let queued_at = now_iso();
        let expires_at = expires_iso(self.ttl_sec);
        let meta_key = self.meta_key(&job_id);
        let results_key = self.results_key(&job_id);

        let tasks: Vec<TaskPayload> = request
            .snippets
            .iter()
            .enumerate()
            .map(|(index, snippet)| TaskPayload::new(&job_id, index, snippet.clone(), &request))
            .collect();

        // A zero-snippet job has nothing left to do; store it terminal so
        // the first poll resolves it with an empty results array.
        let status = if n == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Queued
        };
        let fields: [(&str, String); 8] = [
            ("status", status.as_str().to_owned()),
            ("total", n.to_string()),
            ("done", "0".to_owned()),
            ("failed", "0".to_owned()),
            ("running", "0".to_owned()),
            ("created_at", queued_at.clone()),
            ("updated_at", queued_at.clone()),
            ("expires_at", expires_at.clone()),
        ];

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&meta_key, &fields).ignore();
        if n > 0 {
            let empty_slots = vec![String::new(); n];
            pipe.rpush(&results_key, &empty_slots).ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(&meta_key)
            .arg(self.ttl_sec)
            .ignore();
        pipe.cmd("EXPIRE")
            .arg(&results_key)
            .arg(self.ttl_sec)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        info!(
            job_id = %job_id,
            total = n,
            ttl_sec = self.ttl_sec,
            "job metadata stored"
        );

        if let Err(enqueue_error) = self.queue.enqueue_many(&tasks).await {
            let mark: Result<(), redis::RedisError> = conn
                .hset_multiple(&meta_key, &[("status", "failed"), ("error", "enqueue_failed")])
                .await;
            if let Err(mark_error) = mark {
                error!(job_id = %job_id, error = %mark_error, "failed to mark job after enqueue failure");
            }
            error!(
                job_id = %job_id,
                queue = %self.queue_name,
                error = %enqueue_error,
                "task enqueue failed"
            );
            return Err(enqueue_error);
        }
        info!(job_id = %job_id, tasks = tasks.len(), queue = %self.queue_name, "job enqueued");

        Ok(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            total_snippets: n,
            queued_at,
            expires_at,
        })
    }

    async fn poll(&self, job_id: &str) -> Result<Option<PollResponse>, JobsError> {
        let Some(meta) = self.read_meta(job_id).await? else {
            warn!(job_id = %job_id, "poll miss");
            return Ok(None);
        };

        let status = meta
            .get("status")
            .map(String::as_str)
            .unwrap_or("queued")
            .parse::<JobStatus>()?;
        let total = meta_u64(&meta, "total");

        let mut results = None;
        if status.is_terminal() {
            let mut conn = self.connection.clone();
            let raw: Vec<String> = conn.lrange(self.results_key(job_id), 0, -1).await?;
            let mut parsed = Vec::with_capacity(raw.len());
            for item in raw {
                if item.is_empty() {
                    continue;
                }
                parsed.push(deserialize_result(&item)?);
            }
            if parsed.len() as u64 == total {
                results = Some(parsed);
            }
        }

        debug!(
            job_id = %job_id,
            status = %status,
            total,
            has_results = results.is_some(),
            "poll hit"
        );
        Ok(Some(PollResponse {
            job_id: job_id.to_owned(),
            status,
            progress: Progress {
                total,
                done: meta_u64(&meta, "done"),
                failed: meta_u64(&meta, "failed"),
                running: meta_u64(&meta, "running"),
            },
            results,
            created_at: meta.get("created_at").cloned().unwrap_or_else(now_iso),
            updated_at: meta.get("updated_at").cloned().unwrap_or_else(now_iso),
            expires_at: meta
                .get("expires_at")
                .cloned()
                .unwrap_or_else(|| expires_iso(self.ttl_sec)),
            error: meta.get("error").cloned(),
        }))
    }

    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError> {
        self.queue.dequeue(timeout).await
    }

    async fn mark_task_started(&self, task: &TaskPayload) -> Result<(), JobsError> {
        let meta_key = self.meta_key(&task.job_id);
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(&meta_key).await?;
        if !exists {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                index = task.index,
                snippet_id = %task.snippet.id,
                "task start ignored, job metadata is gone"
            );
            return Ok(());
        }

        let fields: [(&str, String); 2] = [
            ("status", JobStatus::Running.as_str().to_owned()),
            ("updated_at", now_iso()),
        ];
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&meta_key, &fields).ignore();
        pipe.hincr(&meta_key, "running", 1).ignore();
        pipe.cmd("EXPIRE")
            .arg(&meta_key)
            .arg(self.ttl_sec)
            .ignore();
        pipe.cmd("EXPIRE")
            .arg(self.results_key(&task.job_id))
            .arg(self.ttl_sec)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            index = task.index,
            snippet_id = %task.snippet.id,
            "task started"
        );
        Ok(())
    }

    async fn mark_task_success(
        &self,
        task: &TaskPayload,
        response: ReplResponse,
    ) -> Result<(), JobsError> {
        let payload = serde_json::to_value(&response)?;
        self.finalize_slot(task, payload, false).await
    }

    async fn mark_task_failure(
        &self,
        task: &TaskPayload,
        error: &str,
        snippet_id: &str,
    ) -> Result<(), JobsError> {
        let payload = serde_json::to_value(ReplResponse::failure(snippet_id, error))?;
        self.finalize_slot(task, payload, true).await
    }

    async fn close(&self) {
        info!(queue = %self.queue_name, "closing jobs backend");
        self.queue.close().await;
    }
}

struct JobEntry {
    status: JobStatus,
    total: usize,
    done: usize,
    failed: usize,
    running: usize,
    created_at: String,
    updated_at: String,
    expires_at: String,
    error: Option<String>,
    slots: Vec<Option<Value>>,
}

/// The in-process backend: plain maps under a single lock, an unbounded
/// in-memory FIFO. Not durable across restarts; tests and dev only.
pub struct InMemoryJobs {
    ttl_sec: u64,
    backlog_limit: usize,
    queue: MemoryTaskQueue,
    state: Mutex<HashMap<String, JobEntry>>,
}

impl InMemoryJobs {
    pub fn new(ttl_sec: u64, backlog_limit: usize) -> Self {
        Self {
            ttl_sec,
            backlog_limit,
            queue: MemoryTaskQueue::new(),
            state: Mutex::new(HashMap::new()),
        }
    }

    async fn finalize_slot(
        &self,
        task: &TaskPayload,
        payload: Value,
        is_failure: bool,
    ) -> Result<(), JobsError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(&task.job_id) else {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                index = task.index,
                failure = is_failure,
                "result write ignored, job metadata is gone"
            );
            return Ok(());
        };

        let Some(slot) = entry.slots.get_mut(task.index) else {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                index = task.index,
                total = entry.total,
                "result write ignored, slot index out of range"
            );
            return Ok(());
        };
        let first_write = slot.is_none();
        *slot = Some(payload);
        if first_write {
            entry.running = entry.running.saturating_sub(1);
            if is_failure {
                entry.failed += 1;
            } else {
                entry.done += 1;
            }
        }
        entry.updated_at = now_iso();
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            index = task.index,
            snippet_id = %task.snippet.id,
            failure = is_failure,
            done = entry.done,
            failed = entry.failed,
            total = entry.total,
            "result stored"
        );
        if entry.done + entry.failed >= entry.total {
            entry.status = JobStatus::Completed;
            info!(
                job_id = %task.job_id,
                done = entry.done,
                failed = entry.failed,
                total = entry.total,
                "job completed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Jobs for InMemoryJobs {
    async fn submit(&self, request: CheckRequest) -> Result<SubmitResponse, JobsError> {
        let n = request.snippets.len();
        let queue_depth = self.queue.length().await?;
        if queue_depth + n > self.backlog_limit {
            warn!(
                depth = queue_depth,
                incoming = n,
                backlog_limit = self.backlog_limit,
                "submit rejected, backlog full"
            );
            return Err(JobsError::BacklogFull {
                observed: queue_depth + n,
                limit: self.backlog_limit,
            });
        }

        let job_id = fresh_job_id();
        let queued_at = now_iso();
        let expires_at = expires_iso(self.ttl_sec);
        let tasks: Vec<TaskPayload> = request
            .snippets
            .iter()
            .enumerate()
            .map(|(index, snippet)| TaskPayload::new(&job_id, index, snippet.clone(), &request))
            .collect();

        {
            let mut state = self.state.lock().await;
            state.insert(
                job_id.clone(),
                JobEntry {
                    status: if n == 0 {
                        JobStatus::Completed
                    } else {
                        JobStatus::Queued
                    },
                    total: n,
                    done: 0,
                    failed: 0,
                    running: 0,
                    created_at: queued_at.clone(),
                    updated_at: queued_at.clone(),
                    expires_at: expires_at.clone(),
                    error: None,
                    slots: vec![None; n],
                },
            );
        }

        self.queue.enqueue_many(&tasks).await?;
        info!(job_id = %job_id, tasks = tasks.len(), "job enqueued");
        Ok(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            total_snippets: n,
            queued_at,
            expires_at,
        })
    }

    async fn poll(&self, job_id: &str) -> Result<Option<PollResponse>, JobsError> {
        let state = self.state.lock().await;
        let Some(entry) = state.get(job_id) else {
            warn!(job_id = %job_id, "poll miss");
            return Ok(None);
        };

        let mut results = None;
        if entry.status.is_terminal() && entry.slots.iter().all(|slot| slot.is_some()) {
            results = Some(entry.slots.iter().flatten().cloned().collect());
        }
        Ok(Some(PollResponse {
            job_id: job_id.to_owned(),
            status: entry.status,
            progress: Progress {
                total: entry.total as u64,
                done: entry.done as u64,
                failed: entry.failed as u64,
                running: entry.running as u64,
            },
            results,
            created_at: entry.created_at.clone(),
            updated_at: entry.updated_at.clone(),
            expires_at: entry.expires_at.clone(),
            error: entry.error.clone(),
        }))
    }

    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError> {
        self.queue.dequeue(timeout).await
    }

    async fn mark_task_started(&self, task: &TaskPayload) -> Result<(), JobsError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(&task.job_id) else {
            warn!(
                job_id = %task.job_id,
                task_id = %task.task_id,
                index = task.index,
                snippet_id = %task.snippet.id,
                "task start ignored, job metadata is gone"
            );
            return Ok(());
        };
        entry.status = JobStatus::Running;
        entry.running += 1;
        entry.updated_at = now_iso();
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            index = task.index,
            snippet_id = %task.snippet.id,
            "task started"
        );
        Ok(())
    }

    async fn mark_task_success(
        &self,
        task: &TaskPayload,
        response: ReplResponse,
    ) -> Result<(), JobsError> {
        let payload = serde_json::to_value(&response)?;
        self.finalize_slot(task, payload, false).await
    }

    async fn mark_task_failure(
        &self,
        task: &TaskPayload,
        error: &str,
        snippet_id: &str,
    ) -> Result<(), JobsError> {
        let payload = serde_json::to_value(ReplResponse::failure(snippet_id, error))?;
        self.finalize_slot(task, payload, true).await
    }

    async fn close(&self) {
        info!("closing in-memory jobs backend");
        self.queue.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Snippet;
    use serde_json::json;

    fn request(ids: &[&str]) -> CheckRequest {
        CheckRequest {
            snippets: ids
                .iter()
                .map(|id| Snippet {
                    id: (*id).to_owned(),
                    code: "#check Nat".to_owned(),
                })
                .collect(),
            timeout: 30,
            debug: false,
            reuse: true,
            infotree: None,
        }
    }

    fn success(id: &str) -> ReplResponse {
        ReplResponse {
            id: id.to_owned(),
            time: 0.2,
            response: Some(json!({"env": 0})),
            error: None,
        }
    }

    #[tokio::test]
    async fn submit_and_complete_single_job() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&["s1"])).await.unwrap();
        assert_eq!(submit.status, JobStatus::Queued);
        assert_eq!(submit.total_snippets, 1);
        assert_eq!(submit.job_id.len(), 32);

        let poll = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(poll.status, JobStatus::Queued);
        assert_eq!(poll.progress.total, 1);
        assert!(poll.results.is_none());

        let task = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("task must be queued");
        jobs.mark_task_started(&task).await.unwrap();

        // Still running: counters move but no results yet.
        let running = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.progress.running, 1);
        assert!(running.results.is_none());

        jobs.mark_task_success(&task, success("s1")).await.unwrap();

        let done = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.done, 1);
        assert_eq!(done.progress.running, 0);
        let results = done.results.expect("completed job must carry results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], "s1");
    }

    #[tokio::test]
    async fn out_of_order_completion_preserves_result_order() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&["a", "b"])).await.unwrap();

        let t1 = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let t2 = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        // Complete the second snippet first; poll must still return the
        // submission order.
        jobs.mark_task_started(&t2).await.unwrap();
        jobs.mark_task_success(&t2, success("b")).await.unwrap();
        jobs.mark_task_started(&t1).await.unwrap();
        jobs.mark_task_success(&t1, success("a")).await.unwrap();

        let done = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        let results = done.results.unwrap();
        let ids: Vec<&str> = results
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn backlog_limit_rejects_second_submit() {
        let jobs = InMemoryJobs::new(3600, 1);
        jobs.submit(request(&["s1"])).await.unwrap();

        let rejected = jobs.submit(request(&["s2"])).await;
        match rejected {
            Err(JobsError::BacklogFull { observed, limit }) => {
                assert_eq!(observed, 2);
                assert_eq!(limit, 1);
            }
            other => panic!("expected BacklogFull, got {other:?}"),
        }

        // Draining the queue makes room again.
        let task = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        jobs.mark_task_success(&task, success("s1")).await.unwrap();
        jobs.submit(request(&["s2"])).await.unwrap();
    }

    #[tokio::test]
    async fn empty_submit_is_terminal_on_first_poll() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&[])).await.unwrap();
        assert_eq!(submit.total_snippets, 0);

        let poll = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(poll.status, JobStatus::Completed);
        assert_eq!(poll.progress.total, 0);
        assert_eq!(poll.results, Some(vec![]));
    }

    #[tokio::test]
    async fn unknown_job_polls_as_none() {
        let jobs = InMemoryJobs::new(3600, 10);
        assert!(jobs.poll("not-a-real-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_for_missing_job_is_a_noop() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&["s1"])).await.unwrap();

        let orphan = TaskPayload::new("missing-job", 0, request(&["s1"]).snippets[0].clone(), &request(&["s1"]));
        jobs.mark_task_started(&orphan).await.unwrap();
        jobs.mark_task_success(&orphan, success("s1")).await.unwrap();
        jobs.mark_task_failure(&orphan, "boom", "s1").await.unwrap();

        // The real job is untouched.
        let poll = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(poll.status, JobStatus::Queued);
        assert_eq!(poll.progress.done, 0);
        assert_eq!(poll.progress.failed, 0);
        assert!(jobs.poll("missing-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replayed_finalize_does_not_double_count() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&["s1", "s2"])).await.unwrap();
        let task = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        jobs.mark_task_started(&task).await.unwrap();
        jobs.mark_task_success(&task, success("s1")).await.unwrap();
        jobs.mark_task_success(&task, success("s1")).await.unwrap();

        let poll = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(poll.progress.done, 1);
        assert_eq!(poll.progress.failed, 0);
        assert!(poll.progress.done + poll.progress.failed <= poll.progress.total);
    }

    #[tokio::test]
    async fn task_failure_records_error_slot() {
        let jobs = InMemoryJobs::new(3600, 10);
        let submit = jobs.submit(request(&["s1"])).await.unwrap();
        let task = jobs
            .dequeue_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        jobs.mark_task_started(&task).await.unwrap();
        jobs.mark_task_failure(&task, "No available REPLs", "s1")
            .await
            .unwrap();

        let done = jobs.poll(&submit.job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.failed, 1);
        let results = done.results.unwrap();
        assert_eq!(results[0], json!({"id": "s1", "time": 0.0, "error": "No available REPLs"}));
    }
}
