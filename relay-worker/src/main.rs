//! Consume the configured topics partition by partition, log every message
//! and optionally forward it to another topic.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_common::broker::kafka::ConsumerSettings;
use relay_common::broker::KafkaBroker;
use relay_common::metrics::{serve, setup_metrics_router};
use relay_common::producer::Producer;
use relay_common::supervisor::{Supervisor, SupervisorConfig};
use relay_common::{pg, signals};
use relay_worker::app::app;
use relay_worker::config::Config;
use relay_worker::handler::RelayHandler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env()?;

    if config.run_migrations {
        let dsn = config.database.database_url.as_deref().unwrap_or_default();
        let path = config
            .database
            .migration_path
            .as_deref()
            .unwrap_or("./migrations");
        pg::migrate(dsn, path).await?;
    }

    let liveness = HealthRegistry::new("liveness");
    let ready = Arc::new(AtomicBool::new(false));

    let router = app(liveness.clone(), ready.clone()).merge(setup_metrics_router()?);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            error!("failed to serve metrics and probes on {}: {}", bind, err);
        }
    });

    let kafka_liveness = liveness
        .register("rdkafka".to_string(), config.liveness_deadline.0)
        .await;
    let broker = Arc::new(
        KafkaBroker::new(&config.kafka, Some(kafka_liveness))?
            .with_consumer_settings(ConsumerSettings::from(&config.consumer)),
    );

    let producer = Arc::new(Producer::new(broker.clone()));
    let handler = Arc::new(RelayHandler::new(
        producer.clone(),
        config.forward_topic.clone(),
        config.produce_timeout.0,
    ));

    let supervisor = Supervisor::new(
        broker,
        SupervisorConfig {
            liveness_deadline: config.liveness_deadline.0,
            ..SupervisorConfig::from(&config.consumer)
        },
    )
    .with_health_registry(liveness);

    let shutdown = signals::shutdown_token();
    ready.store(true, Ordering::SeqCst);
    let result = supervisor
        .run(
            config.consumer.kafka_consumer_topics.0.as_slice(),
            config.consumer.kafka_consumer_group.as_str(),
            handler,
            shutdown,
        )
        .await;
    ready.store(false, Ordering::SeqCst);

    if let Err(err) = producer.close().await {
        warn!("failed to flush producer on shutdown: {}", err);
    }

    let summary = result?;
    info!(
        partitions = summary.partitions.len(),
        terminated = summary.terminated.len(),
        "relay worker stopped"
    );
    for (partition, reason) in &summary.terminated {
        warn!(%partition, "partition was terminated during the run: {}", reason);
    }

    Ok(())
}
