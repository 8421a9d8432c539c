use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use databus_consumer::config::Config;
use databus_consumer::router::{router, serve, setup_metrics_routes};
use databus_consumer::{Consumer, KafkaMessage, MessageHandler};

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

/// Logs every message it receives
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &KafkaMessage) -> anyhow::Result<()> {
        info!(
            topic = message.get_topic(),
            partition = message.get_partition(),
            offset = message.get_offset(),
            key = message.routing_key().as_deref().unwrap_or(""),
            payload_bytes = message.get_payload().map_or(0, <[u8]>::len),
            "received message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;
    info!("Starting databus consumer...");

    let config = Config::init_from_env().context("failed to load configuration from env")?;
    let consumer_config = config.consumer_config();
    info!(
        kafka_hosts = %config.kafka_hosts,
        topic = %config.kafka_consumer_topic,
        group_id = %config.kafka_consumer_group,
        workers = consumer_config.effective_worker_count(),
        "Configuration loaded"
    );

    let consumer = Arc::new(
        Consumer::new(consumer_config, Arc::new(LoggingHandler))
            .context("failed to create kafka consumer")?,
    );

    let app = setup_metrics_routes(router(consumer.clone()))
        .context("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!(error = %e, bind = %bind, "health server failed");
        }
    });

    consumer.start().context("failed to start consumer")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("Shutdown signal received");

    consumer.close().await;
    info!("Databus consumer shut down");
    Ok(())
}
