use std::{future::ready, sync::Arc};

use axum::{routing::get, Router};
use plugin_server::{app_context::AppContext, config::Config, error::ServerError};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "plugin server"
}

fn start_health_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.health_registry.get_status())),
        );
    let router = common_metrics::setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        common_metrics::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let config = Config::init_with_defaults()?;
    setup_tracing(&config.log_level);
    info!("starting plugin server...");

    let context = Arc::new(AppContext::new(&config).await?);

    start_health_liveness_server(&config, context.clone());

    let scheduler_context = context.clone();
    tokio::spawn(async move { scheduler_context.scheduler.run().await });

    info!(
        topic = config.consumer.kafka_consumer_topic,
        workers = config.worker_concurrency,
        "consuming events"
    );

    // Only consumer-level fatals get here; worker tasks report failure as
    // values and the loop keeps going
    context.queue_consumer.start().await
}
