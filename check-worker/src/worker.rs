use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use check_common::health::Liveness;
use check_common::jobs::Jobs;
use check_common::queue::TaskPayload;

use crate::checker::{CheckOptions, Checker};
use crate::error::{CheckerError, WorkerError};

/// Status codes from the checker that are worth retrying: the checker was
/// overloaded or transiently broken, not wrong about the snippet.
fn is_transient_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// A worker draining the task queue: one task per iteration, a checker
/// invocation with a bounded retry policy, and the outcome recorded in the
/// job's result slot.
pub struct CheckWorker {
    jobs: Arc<dyn Jobs>,
    checker: Arc<dyn Checker>,
    /// Short so that process-level cancellation drains within one iteration.
    dequeue_timeout: Duration,
    /// Checker attempts per task. Retries share the task id; the result
    /// slot is written once with the final outcome.
    retries: u32,
}

impl CheckWorker {
    pub fn new(
        jobs: Arc<dyn Jobs>,
        checker: Arc<dyn Checker>,
        dequeue_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            jobs,
            checker,
            dequeue_timeout,
            retries,
        }
    }

    /// Run one iteration. Returns `false` when the dequeue timed out with
    /// no work available.
    pub async fn process_task(&self) -> Result<bool, WorkerError> {
        let Some(task) = self.jobs.dequeue_task(self.dequeue_timeout).await? else {
            return Ok(false);
        };

        let span = tracing::info_span!(
            "check_task",
            job_id = %task.job_id,
            task_id = %task.task_id,
            snippet_id = %task.snippet.id,
        );
        self.handle_task(task).instrument(span).await?;
        Ok(true)
    }

    async fn handle_task(&self, task: TaskPayload) -> Result<(), WorkerError> {
        let started = Instant::now();
        info!(
            index = task.index,
            timeout = task.timeout,
            debug = task.debug,
            reuse = task.reuse,
            "dequeued task"
        );
        metrics::counter!("check_tasks_total").increment(1);

        self.jobs.mark_task_started(&task).await?;

        let options = CheckOptions::from_task(&task);
        let mut attempt = 1u32;
        loop {
            let outcome = self
                .checker
                .run_checks(std::slice::from_ref(&task.snippet), &options)
                .await;
            match outcome {
                Ok(responses) => {
                    let Some(response) = responses.into_iter().next() else {
                        error!(attempt, "checker returned no responses");
                        self.jobs
                            .mark_task_failure(
                                &task,
                                "worker_error: checker returned no responses",
                                &task.snippet.id,
                            )
                            .await?;
                        metrics::counter!("check_tasks_failed").increment(1);
                        return Ok(());
                    };
                    self.jobs.mark_task_success(&task, response).await?;
                    metrics::counter!("check_tasks_completed").increment(1);
                    metrics::histogram!("check_task_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    info!(
                        attempt,
                        elapsed_sec = started.elapsed().as_secs_f64(),
                        "task completed"
                    );
                    return Ok(());
                }
                Err(CheckerError::Status { status, detail }) => {
                    if is_transient_status(status) && attempt < self.retries {
                        warn!(
                            attempt,
                            retries = self.retries,
                            status = status.as_u16(),
                            detail = %detail,
                            "transient checker error, retrying"
                        );
                        metrics::counter!("check_tasks_retried").increment(1);
                        attempt += 1;
                        continue;
                    }
                    warn!(
                        attempt,
                        retries = self.retries,
                        status = status.as_u16(),
                        detail = %detail,
                        elapsed_sec = started.elapsed().as_secs_f64(),
                        "task failed with checker error"
                    );
                    self.jobs
                        .mark_task_failure(&task, &detail, &task.snippet.id)
                        .await?;
                    metrics::counter!("check_tasks_failed").increment(1);
                    return Ok(());
                }
                Err(unexpected) => {
                    error!(
                        attempt,
                        error = %unexpected,
                        elapsed_sec = started.elapsed().as_secs_f64(),
                        "task failed with unexpected error"
                    );
                    self.jobs
                        .mark_task_failure(
                            &task,
                            &format!("worker_error: {unexpected}"),
                            &task.snippet.id,
                        )
                        .await?;
                    metrics::counter!("check_tasks_failed").increment(1);
                    return Ok(());
                }
            }
        }
    }

    /// Drain the queue forever. Per-task failures are recorded in result
    /// slots; backend errors are logged and the loop keeps going.
    pub async fn run(&self, liveness: Liveness) {
        loop {
            liveness.beat();
            match self.process_task().await {
                Ok(_) => {}
                Err(error) => error!("failed to process check task: {}", error),
            }
        }
    }
}
