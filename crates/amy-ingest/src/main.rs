//! AMY telemetry ingest — MQTT listener fleet for medical IoT devices.
//!
//! Wires the three device-family listeners, the patient resolver, the
//! dual-write canonical writer, and the data-flow emitter into one
//! service binary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use amy_ingest::config::IngestConfig;
use amy_ingest::dataflow::HttpEventSink;
use amy_ingest::listener::{Listener, ListenerKind};
use amy_ingest::pipeline::Pipeline;
use amy_ingest::resolver::PatientResolver;
use amy_ingest::store::MongoStore;
use amy_ingest::writer::CanonicalWriter;

/// Deadline for flushing queued flow events after the listeners stop.
const EVENT_FLUSH_DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "amy-ingest starting");

    // ── Load config ─────────────────────────────────────────────
    let config = match std::env::args().nth(1) {
        Some(path) => IngestConfig::from_file(&path)?,
        None => IngestConfig::from_env(),
    };
    tracing::info!(
        broker = %config.mqtt.host,
        db = %config.db.name,
        collector = %config.dataflow.collector_url,
        "config loaded"
    );

    // ── Document store ──────────────────────────────────────────
    let store = Arc::new(
        MongoStore::connect(&config.db.uri, &config.db.name, &config.db.audit_name).await?,
    );
    tracing::info!("document store connected");

    // ── Data-flow emitter ───────────────────────────────────────
    let (sink, drainer) = HttpEventSink::new(
        &config.dataflow.collector_url,
        config.dataflow.channel_capacity,
    );
    let sink = Arc::new(sink);
    let drainer_handle = tokio::spawn(drainer.run());

    // ── Pipeline ────────────────────────────────────────────────
    let resolver = PatientResolver::new(store.clone(), config.resolver.cache_ttl_s);
    let writer = CanonicalWriter::new(store, config.writer.settings());
    let pipeline = Arc::new(Pipeline::new(resolver, writer, sink.clone()));

    // ── Listener fleet ──────────────────────────────────────────
    let pool = Arc::new(Semaphore::new(config.listener.effective_worker_pool()));
    let drain = Duration::from_secs(config.shutdown.drain_s);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut listeners = JoinSet::new();
    for kind in [ListenerKind::Ava4, ListenerKind::Kati, ListenerKind::Qube] {
        let listener = Listener::new(kind, &config.mqtt, pipeline.clone(), pool.clone())?;
        listeners.spawn(listener.run(shutdown_rx.clone(), drain));
    }
    tracing::info!(
        workers = config.listener.effective_worker_pool(),
        "amy-ingest ready"
    );

    // ── Graceful shutdown on SIGINT/SIGTERM ─────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    while listeners.join_next().await.is_some() {}

    // Release the emitter so the drainer sees end-of-stream, then give
    // it a bounded window to flush what is queued.
    drop(pipeline);
    let dropped = sink.dropped_events();
    drop(sink);
    if tokio::time::timeout(EVENT_FLUSH_DEADLINE, drainer_handle)
        .await
        .is_err()
    {
        tracing::warn!("event flush deadline exceeded");
    }
    if dropped > 0 {
        tracing::warn!(dropped_events = dropped, "flow events dropped this run");
    }

    tracing::info!("amy-ingest stopped");
    Ok(())
}
