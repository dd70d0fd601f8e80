use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zoocare_ingestor::config::Config;
use zoocare_ingestor::rest::{self, AppState};
use zoocare_ingestor::store::{MemoryStore, PgStore, Store};
use zoocare_ingestor::{metrics, mqtt, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    info!("Starting zoo telemetry ingestor");
    info!("MQTT broker: {}:{} ({})", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.masked_database_url());

    metrics::init_metrics();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => match PgStore::connect(url, config.db_pool_max).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATABASE_URL not set; readings and alerts are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(store, config.pipeline);

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let client_id = format!("zoo-ingestor-{}", uuid::Uuid::new_v4());
    let (broker, port, topic) = (
        config.mqtt_broker.clone(),
        config.mqtt_port,
        config.mqtt_topic.clone(),
    );
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(broker, port, topic, client_id, tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let worker_handle = tokio::spawn(worker::run_worker(
        rx,
        state.service().clone(),
        config.retention_sweep_interval_secs,
    ));

    let health_handle = tokio::spawn(
        state
            .health()
            .clone()
            .run(config.health_check_interval_secs),
    );

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = worker_handle => {
            error!("Worker task terminated");
        }
        _ = health_handle => {
            error!("Health-check task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
