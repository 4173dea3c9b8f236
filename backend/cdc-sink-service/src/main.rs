use anyhow::{bail, Context, Result};
use cdc_sink_service::config::Config;
use cdc_sink_service::error::ConsumeError;
use cdc_sink_service::kafka::{KafkaSource, KafkaTopicAdmin};
use cdc_sink_service::metrics;
use cdc_sink_service::services::apply::{ApplyLayer, Sink};
use cdc_sink_service::services::pipeline::{
    CdcHandler, CoordinatorConfig, TopicCoordinator, TopicReport,
};
use cdc_sink_service::store::{self, PgStore, ScyllaLedger, ScyllaStore};
use idempotent_consumer::PgLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LEDGER_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        topics = ?config.kafka.topics,
        sinks = ?config.sinks,
        "Starting cdc-sink-service"
    );

    let mut sinks = Vec::new();
    let mut background = Vec::new();

    if let Some(cassandra) = &config.cassandra {
        let session = store::connect_scylla(&cassandra.hosts, &cassandra.keyspace)
            .await
            .context("Failed to connect to Cassandra")?;
        sinks.push(Sink::new(
            "cassandra",
            Arc::new(ScyllaStore::new(session.clone())),
            Arc::new(
                ScyllaLedger::new(session, config.ledger_retention).with_lease(config.claim_lease),
            ),
        ));
        info!(keyspace = %cassandra.keyspace, "Cassandra sink ready");
    }

    if let Some(db) = &config.database {
        let pool = PgStore::connect(db)
            .await
            .context("Failed to create database pool")?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        let ledger = Arc::new(
            PgLedger::new(pool.clone(), config.ledger_retention).with_lease(config.claim_lease),
        );
        background.push(spawn_ledger_cleanup(ledger.clone()));

        sinks.push(Sink::new("postgres", Arc::new(PgStore::new(pool)), ledger));
        info!("Postgres sink ready");
    }

    let handler = Arc::new(CdcHandler::new(Arc::new(ApplyLayer::new(sinks))));
    let admin = match config.kafka.create_topics {
        Some(_) => Some(Arc::new(
            KafkaTopicAdmin::new(&config.kafka.brokers)
                .context("Failed to create Kafka admin client")?,
        )),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            // Dropping the sender would read as a shutdown request
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining partition workers");
        let _ = shutdown_tx.send(true);
    });

    let metrics_listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", config.metrics_addr))?;
    let metrics_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_listener, metrics_shutdown).await {
            error!("Metrics server failed: {}", e);
        }
    }));

    let mut runs = Vec::with_capacity(config.kafka.topics.len());
    for topic in &config.kafka.topics {
        let source = Arc::new(
            KafkaSource::new(&config.kafka.brokers, &config.kafka.group_id, topic)
                .with_context(|| format!("Failed to create consumer for {}", topic))?,
        );

        let coordinator_config = CoordinatorConfig {
            topic: topic.clone(),
            group_id: config.kafka.group_id.clone(),
            queue_capacity: config.pipeline.queue_capacity,
            idle_timeout: config.pipeline.idle_timeout,
            process_policy: config.pipeline.process_policy(),
            readiness_policy: config.pipeline.readiness_policy(),
            readiness_delay: config.pipeline.group_initial_backoff,
            ensure_topic: config.kafka.create_topics,
        };

        let mut coordinator =
            TopicCoordinator::new(coordinator_config, source.clone(), source, handler.clone());
        if let Some(admin) = &admin {
            coordinator = coordinator.with_admin(admin.clone());
        }

        let shutdown = shutdown_rx.clone();
        runs.push(tokio::spawn(coordinator.run(shutdown)));
    }

    let mut failed = 0usize;
    for (topic, run) in config.kafka.topics.iter().zip(futures::future::join_all(runs).await) {
        match run {
            Ok(Ok(report)) => failed += log_report(&report),
            Ok(Err(ConsumeError::FetchAborted { source, report })) => {
                error!(topic = %topic, error = %source, "Topic consumption aborted by fetch error");
                failed += 1 + log_report(&report);
            }
            Ok(Err(e)) => {
                error!(topic = %topic, error = %e, "Topic consumption failed");
                failed += 1;
            }
            Err(e) => {
                error!(topic = %topic, "Coordinator task panicked: {}", e);
                failed += 1;
            }
        }
    }

    for task in background {
        task.abort();
    }

    if failed > 0 {
        bail!("{} topic or partition run(s) did not finish cleanly", failed);
    }

    info!("cdc-sink-service stopped");
    Ok(())
}

/// Log a finished topic run; returns the number of partitions that failed.
fn log_report(report: &TopicReport) -> usize {
    info!(
        topic = %report.topic,
        reason = ?report.reason,
        dispatched = report.messages_dispatched,
        "Topic consumption finished"
    );

    let mut failed = 0;
    for partition in report.partitions.iter().filter(|p| !p.exit.is_clean()) {
        warn!(
            topic = %report.topic,
            partition = partition.partition,
            exit = ?partition.exit,
            "Partition worker stopped early"
        );
        failed += 1;
    }
    failed
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_sink_service=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn spawn_ledger_cleanup(ledger: Arc<PgLedger>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LEDGER_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match ledger.cleanup_old_events().await {
                Ok(deleted) if deleted > 0 => info!(deleted = deleted, "Pruned dedup ledger"),
                Ok(_) => {}
                Err(e) => warn!("Dedup ledger cleanup failed: {}", e),
            }
        }
    })
}
