//! Pipeline worker binary.
//!
//! Runs one job against the configured input and exits with a non-zero
//! status if the job fails.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vannot_models::JobStatus;
use vannot_worker::{JobHost, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in ["vannot=info"] {
        match directive.parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
        }
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vannot-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let metrics = if config.metrics_enabled {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to install metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    let model = Arc::new(config.scripted_model());
    let video = Box::new(config.synthetic_video());
    let host = JobHost::new(model, config);

    let summary = match host.run(video, shutdown).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Job did not finish: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(handle) = metrics {
        debug!("Metrics snapshot:\n{}", handle.render());
    }

    match serde_json::to_string(&summary) {
        Ok(json) => info!(summary = %json, "Job summary"),
        Err(e) => warn!("Failed to serialize job summary: {}", e),
    }

    if summary.status == JobStatus::Failed {
        error!(
            "Job {} failed: {}",
            summary.job_id,
            summary.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
