use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use check_common::jobs::create_jobs;
use check_common::metrics::setup_metrics_routes;
use handlers::AppState;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let jobs = if config.async_enabled {
        let jobs = create_jobs(&config.jobs_settings())
            .await
            .expect("failed to initialize the async jobs backend");
        tracing::info!(
            queue = %config.async_queue_name,
            max_queue_wait_sec = config.async_max_queue_wait_sec,
            "async check API enabled"
        );
        Some(jobs)
    } else {
        tracing::warn!("async check API disabled, submit and poll will answer 503");
        None
    };

    let state = AppState {
        jobs,
        api_key: config.api_key.clone(),
    };
    let app = handlers::add_routes(Router::new(), state, config.max_body_size);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start check-api http server, {}", e),
    }
}
