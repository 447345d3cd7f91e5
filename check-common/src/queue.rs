//! The task queue: a FIFO of per-snippet task payloads shared by every
//! worker process. The durable variant lives on a single redis list; the
//! in-process variant backs tests and development runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::info;
use uuid::Uuid;

use crate::error::JobsError;
use crate::types::{CheckRequest, Infotree, Snippet};

/// Current UTC time as an RFC 3339 string with offset, e.g.
/// `2024-05-01T12:34:56.789012+00:00`. Stored timestamps are opaque to
/// callers.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// One snippet plus its execution options, as carried on the queue. The
/// `index` is the snippet's position in the original submission and is the
/// stable slot address for its result.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct TaskPayload {
    pub job_id: String,
    pub task_id: String,
    pub index: usize,
    pub snippet: Snippet,
    pub timeout: f64,
    pub debug: bool,
    pub reuse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infotree: Option<Infotree>,
    /// Informational; stamped when the payload is constructed, not when it
    /// is pushed.
    pub enqueued_at: String,
}

impl TaskPayload {
    /// Build the payload for the `index`-th snippet of a submission, with a
    /// fresh task id.
    pub fn new(job_id: &str, index: usize, snippet: Snippet, request: &CheckRequest) -> Self {
        Self {
            job_id: job_id.to_owned(),
            task_id: Uuid::new_v4().simple().to_string(),
            index,
            snippet,
            timeout: request.timeout as f64,
            debug: request.debug,
            reuse: request.reuse,
            infotree: request.infotree,
            enqueued_at: now_iso(),
        }
    }
}

/// Encode a result payload for slot storage: compact UTF-8 JSON, no
/// whitespace.
pub fn serialize_result(payload: &Value) -> Result<String, JobsError> {
    Ok(serde_json::to_string(payload)?)
}

/// Decode a stored slot value. Slots only ever hold JSON objects; anything
/// else means the slot was corrupted.
pub fn deserialize_result(raw: &str) -> Result<Value, JobsError> {
    let parsed: Value = serde_json::from_str(raw)?;
    if !parsed.is_object() {
        return Err(JobsError::MalformedSlot);
    }
    Ok(parsed)
}

/// FIFO delivery of task payloads to workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Current queue depth. Approximate under contention.
    async fn length(&self) -> Result<usize, JobsError>;

    /// Bulk append in the given order. Empty input is a no-op.
    async fn enqueue_many(&self, tasks: &[TaskPayload]) -> Result<(), JobsError>;

    /// Blocking pop with a timeout; `None` when the timeout expires without
    /// a task becoming available.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError>;

    /// Release client resources.
    async fn close(&self);
}

/// A queue on a single redis list, shared by all worker replicas. BLPOP
/// blocks the connection it runs on, so the queue owns a connection separate
/// from the one used for job-state mutations.
pub struct RedisTaskQueue {
    connection: MultiplexedConnection,
    queue_name: String,
}

impl RedisTaskQueue {
    pub fn new(connection: MultiplexedConnection, queue_name: String) -> Self {
        Self {
            connection,
            queue_name,
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn length(&self) -> Result<usize, JobsError> {
        let mut conn = self.connection.clone();
        let depth: usize = conn.llen(&self.queue_name).await?;
        Ok(depth)
    }

    async fn enqueue_many(&self, tasks: &[TaskPayload]) -> Result<(), JobsError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let payloads = tasks
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let mut conn = self.connection.clone();
        conn.rpush::<_, _, ()>(&self.queue_name, payloads).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError> {
        let mut conn = self.connection.clone();
        let item: Option<(String, String)> = conn
            .blpop(&self.queue_name, timeout.as_secs_f64())
            .await?;
        match item {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        // The multiplexed connection is dropped with the queue.
        info!(queue = %self.queue_name, "closing redis task queue");
    }
}

/// An unbounded in-process FIFO. Not durable; intended for tests and
/// development only.
#[derive(Default)]
pub struct MemoryTaskQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn length(&self) -> Result<usize, JobsError> {
        Ok(self.items.lock().await.len())
    }

    async fn enqueue_many(&self, tasks: &[TaskPayload]) -> Result<(), JobsError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut items = self.items.lock().await;
        for task in tasks {
            items.push_back(serde_json::to_string(task)?);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskPayload>, JobsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(raw) = self.items.lock().await.pop_front() {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            // Re-check periodically so a wakeup lost to another consumer
            // only costs one tick, not the whole timeout.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CheckRequest {
        CheckRequest {
            snippets: vec![],
            timeout: 30,
            debug: false,
            reuse: true,
            infotree: None,
        }
    }

    fn task(job_id: &str, index: usize, snippet_id: &str) -> TaskPayload {
        TaskPayload::new(
            job_id,
            index,
            Snippet {
                id: snippet_id.to_owned(),
                code: "#check Nat".to_owned(),
            },
            &request(),
        )
    }

    #[test]
    fn task_payload_round_trips() {
        let task = task("job-1", 0, "snippet-1");
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: TaskPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, task);
        // Absent infotree must not appear on the wire.
        assert!(!encoded.contains("infotree"));
    }

    #[test]
    fn task_ids_are_32_hex_chars() {
        let task = task("job-1", 0, "s1");
        assert_eq!(task.task_id.len(), 32);
        assert!(task.task_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn result_serialization_round_trips() {
        let payload = json!({"id": "x", "time": 1.2, "response": {"env": 0}});
        let raw = serialize_result(&payload).unwrap();
        assert!(!raw.contains(' '));
        assert_eq!(deserialize_result(&raw).unwrap(), payload);
    }

    #[test]
    fn deserialize_result_rejects_non_objects() {
        assert!(matches!(
            deserialize_result("[1,2]"),
            Err(JobsError::MalformedSlot)
        ));
    }

    #[tokio::test]
    async fn memory_queue_preserves_fifo_order() {
        let queue = MemoryTaskQueue::new();
        let tasks: Vec<TaskPayload> = (0..5).map(|i| task("job-1", i, &format!("s{i}"))).collect();
        queue.enqueue_many(&tasks).await.unwrap();
        assert_eq!(queue.length().await.unwrap(), 5);

        for expected in &tasks {
            let got = queue
                .dequeue(Duration::from_secs(1))
                .await
                .unwrap()
                .expect("task must be available");
            assert_eq!(got.task_id, expected.task_id);
        }
        assert_eq!(queue.length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_queue_empty_enqueue_is_noop() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue_many(&[]).await.unwrap();
        assert_eq!(queue.length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_queue_dequeue_times_out() {
        let queue = MemoryTaskQueue::new();
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn memory_queue_wakes_blocked_consumer() {
        let queue = std::sync::Arc::new(MemoryTaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue_many(&[task("job-1", 0, "s1")]).await.unwrap();

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.expect("task must be delivered").snippet.id, "s1");
    }
}
