//! Prometheus metrics on the default registry, exposed at `GET /metrics`

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

static MESSAGES_PROCESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "cdc_sink_messages_processed_total",
            "CDC messages handled successfully, by outcome",
        ),
        &["topic", "outcome"],
    )
    .expect("failed to create cdc_sink_messages_processed_total");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

static MESSAGES_FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "cdc_sink_messages_failed_total",
            "CDC messages that stopped their partition worker",
        ),
        &["topic", "partition"],
    )
    .expect("failed to create cdc_sink_messages_failed_total");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

static RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "cdc_sink_retries_total",
            "Retried attempts of message processing or offset commits",
        ),
        &["topic", "stage"],
    )
    .expect("failed to create cdc_sink_retries_total");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

static DUPLICATES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "cdc_sink_duplicates_skipped_total",
            "Events skipped because the sink ledger already held them",
        ),
        &["topic", "sink"],
    )
    .expect("failed to create cdc_sink_duplicates_skipped_total");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

static COMMITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("cdc_sink_commits_total", "Offsets committed after apply"),
        &["topic", "partition"],
    )
    .expect("failed to create cdc_sink_commits_total");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

static WORKERS_RUNNING: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("cdc_sink_workers_running", "Partition workers currently running"),
        &["topic"],
    )
    .expect("failed to create cdc_sink_workers_running");
    let _ = prometheus::default_registry().register(Box::new(gauge.clone()));
    gauge
});

pub fn record_processed(topic: &str, outcome: &str) {
    MESSAGES_PROCESSED_TOTAL
        .with_label_values(&[topic, outcome])
        .inc();
}

pub fn record_failed(topic: &str, partition: i32) {
    MESSAGES_FAILED_TOTAL
        .with_label_values(&[topic, &partition.to_string()])
        .inc();
}

pub fn record_retry(topic: &str, stage: &str) {
    RETRIES_TOTAL.with_label_values(&[topic, stage]).inc();
}

pub fn record_duplicate(topic: &str, sink: &str) {
    DUPLICATES_TOTAL.with_label_values(&[topic, sink]).inc();
}

pub fn record_commit(topic: &str, partition: i32) {
    COMMITS_TOTAL
        .with_label_values(&[topic, &partition.to_string()])
        .inc();
}

pub fn worker_started(topic: &str) {
    WORKERS_RUNNING.with_label_values(&[topic]).inc();
}

pub fn worker_stopped(topic: &str) {
    WORKERS_RUNNING.with_label_values(&[topic]).dec();
}

/// Text exposition of every metric in the default registry
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

pub async fn metrics_handler() -> Response {
    match render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve the metrics router until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Serving metrics");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_counters_register_once() {
        record_duplicate("cdc.public.users", "cassandra");
        record_duplicate("cdc.public.users", "cassandra");

        let value = DUPLICATES_TOTAL
            .with_label_values(&["cdc.public.users", "cassandra"])
            .get();
        assert!(value >= 2);
    }

    #[test]
    fn test_render_includes_recorded_counters() {
        record_commit("cdc.public.orders", 4);

        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("# TYPE cdc_sink_commits_total counter"));
        assert!(text.contains(r#"partition="4""#));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_until_shutdown() {
        record_processed("cdc.public.users", "applied");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("cdc_sink_messages_processed_total"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("metrics server did not stop")
            .unwrap()
            .unwrap();
    }
}
