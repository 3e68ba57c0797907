//! Streaming enrichment join engine.
//!
//! Consumes one fact stream and any number of dimension streams from
//! Redpanda, joins each fact with the latest dimension state for its keys and
//! upserts the enriched documents into ClickHouse:
//! - Event-time watermarks with bounded lateness and idle stream handling
//! - Buffering of facts that arrive before their dimension data
//! - At-least-once delivery with idempotent upserts and pipeline-owned offsets

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use api::{router, AppState};
use clickhouse_client::{
    ClickHouseCheckpointStore, ClickHouseClient, ClickHouseConfig, ClickHouseDocumentStore,
};
use engine_core::{LatePolicy, LateRecord, PipelineConfig, SourceId};
use redpanda::{KafkaSource, RedpandaConfig, SourceAdapter};
use telemetry::{health, init_tracing_from_env};
use worker::PipelineCoordinator;

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    #[serde(default)]
    pipeline: PipelineConfig,

    #[serde(default)]
    redpanda: RedpandaConfig,

    #[serde(default)]
    clickhouse: ClickHouseConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pipeline: PipelineConfig::default(),
            redpanda: RedpandaConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    // rustls 0.23+ requires explicit crypto provider selection before any TLS use
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting enrichment engine v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    config
        .pipeline
        .check()
        .context("Invalid pipeline configuration")?;

    info!(
        pipeline = %config.pipeline.pipeline_name,
        brokers = ?config.redpanda.brokers,
        streams = config.pipeline.streams.len(),
        late_data_policy = ?config.pipeline.late_data_policy,
        "Loaded configuration"
    );

    let clickhouse = ClickHouseClient::new(config.clickhouse.clone())
        .context("Failed to create ClickHouse client")?;

    if let Err(e) = clickhouse_client::schema::init_schema(&clickhouse).await {
        // Schema might already exist
        error!(error = %e, "Failed to initialize ClickHouse schema");
    }

    check_health(&config, &clickhouse).await;

    let sources: Vec<Arc<dyn SourceAdapter>> = config
        .pipeline
        .streams
        .iter()
        .map(|spec| {
            Arc::new(KafkaSource::new(
                SourceId::new(spec.id.clone(), spec.partition),
                spec.topic.clone(),
                config.redpanda.clone(),
            )) as Arc<dyn SourceAdapter>
        })
        .collect();

    let mut coordinator = PipelineCoordinator::new(
        config.pipeline.clone(),
        sources,
        Arc::new(ClickHouseDocumentStore::new(clickhouse.clone())),
        Arc::new(ClickHouseCheckpointStore::new(clickhouse.clone())),
    )
    .context("Failed to create pipeline coordinator")?;

    if config.pipeline.late_data_policy == LatePolicy::SideOutput {
        let (tx, rx) = mpsc::channel(config.pipeline.queue_capacity);
        tokio::spawn(log_late_records(rx));
        coordinator = coordinator.with_late_output(tx);
    }

    let shutdown = coordinator.shutdown_handle();
    let state = AppState::new(config.pipeline.pipeline_name.clone(), coordinator.epoch());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);

    let (server_stop_tx, mut server_stop_rx) = watch::channel(false);
    let app = router(state);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_stop_rx.changed().await;
            })
            .await
    });

    let mut pipeline = tokio::spawn(coordinator.run());
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down...");
            shutdown.shutdown();
            (&mut pipeline).await
        }
        result = &mut pipeline => result,
    };

    server_stop_tx.send_replace(true);
    match server.await {
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
        Ok(Ok(())) => {}
    }

    let summary = outcome
        .context("Pipeline task failed")?
        .context("Pipeline stopped with a fatal error")?;

    info!(
        epoch = %summary.epoch,
        documents = summary.documents_written,
        batches = summary.batches_flushed,
        "Shutdown complete"
    );
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables, e.g. ENRICHMENT__PIPELINE__BATCH_SIZE
        .add_source(
            config::Environment::with_prefix("ENRICHMENT")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redpanda.brokers")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Check component health on startup.
async fn check_health(config: &Config, clickhouse: &ClickHouseClient) {
    if redpanda::health::check_connection(&config.redpanda).await {
        health().redpanda.set_healthy();
        info!("Redpanda connection: healthy");
    } else {
        health().redpanda.set_unhealthy("Connection failed");
        error!("Redpanda connection: unhealthy");
    }

    let topics: Vec<&str> = config.pipeline.streams.iter().map(|s| s.topic.as_str()).collect();
    let missing = redpanda::health::missing_topics(&config.redpanda, &topics).await;
    if !missing.is_empty() {
        warn!(topics = ?missing, "Configured topics not found");
    }

    if clickhouse_client::health::check_connection(clickhouse).await {
        health().clickhouse.set_healthy();
        info!("ClickHouse connection: healthy");

        let missing = clickhouse_client::health::missing_tables(clickhouse).await;
        if !missing.is_empty() {
            warn!(tables = ?missing, "ClickHouse tables not found");
        } else if let Ok(documents) = clickhouse_client::count_documents(clickhouse).await {
            info!(documents, "Sink documents at startup");
        }
    } else {
        health().clickhouse.set_unhealthy("Connection failed");
        error!("ClickHouse connection: unhealthy");
    }
}

/// Side output for late facts: structured log lines.
async fn log_late_records(mut rx: mpsc::Receiver<LateRecord>) {
    while let Some(late) = rx.recv().await {
        warn!(
            key = %late.fact.key,
            position = %late.position,
            event_time = late.fact.event_time.0,
            watermark = late.watermark.0,
            "Late fact"
        );
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
