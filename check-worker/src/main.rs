//! Drain the async check queue: dequeue tasks, invoke the external checker,
//! and record outcomes on the jobs backend.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use check_common::health::Liveness;
use check_common::jobs::create_jobs;
use check_common::metrics::{serve, setup_metrics_routes};
use check_worker::checker::HttpChecker;
use check_worker::config::Config;
use check_worker::error::WorkerError;
use check_worker::worker::CheckWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    if !config.async_enabled {
        return Err(WorkerError::AsyncDisabled);
    }

    // The deadline covers one dequeue wait plus a full retry cycle against
    // a slow checker.
    let liveness = Liveness::new(Duration::from_secs(300));
    let worker_liveness = liveness.clone();

    let jobs = create_jobs(&config.jobs_settings()).await?;
    let checker = Arc::new(HttpChecker::new(&config)?);
    let worker = CheckWorker::new(
        jobs.clone(),
        checker,
        Duration::from_secs(config.async_dequeue_timeout_sec),
        config.async_worker_retries,
    );

    tracing::info!(
        queue = %config.async_queue_name,
        checker_url = %config.checker_url,
        retries = config.async_worker_retries,
        dequeue_timeout_sec = config.async_dequeue_timeout_sec,
        min_host_free_mem_mb = config.min_host_free_mem.0,
        "async worker started"
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::select! {
        _ = worker.run(worker_liveness) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }
    jobs.close().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "check worker"
}
