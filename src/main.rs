mod config;
mod error;
mod journal;
mod mqtt;
mod pipeline;
mod record;
mod sink;

use crate::config::Config;
use crate::pipeline::{spawn_accumulator, spawn_sink_worker, IngestStats, PipelineHandle};
use crate::sink::PgSink;
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,broker_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let stats = Arc::new(IngestStats::new());
    let journal = journal::spawn_journal_writer(config.journal_path.clone())?;
    let sink = Arc::new(PgSink::connect(&config.database_url, config.db_pool_size).await?);

    let (batch_tx, batch_rx) = mpsc::channel(config.max_queue);
    let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue);
    let pipeline = PipelineHandle::new(batch_tx, stats.clone());

    let accumulator_handle = spawn_accumulator(
        batch_rx,
        flush_tx,
        stats.clone(),
        config.max_batch_size,
        config.max_batch_latency(),
    );
    let sink_handle = spawn_sink_worker(
        flush_rx,
        sink,
        stats.clone(),
        config.sink_max_attempts,
        config.sink_retry_min(),
        config.sink_retry_max(),
    );

    let mut mqtt_handle = {
        let config = config.clone();
        let journal = journal.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move { mqtt::run_ingest_loop(config, journal, pipeline).await })
    };

    let stats_handle = {
        let stats = stats.clone();
        let interval = config.stats_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::debug!(
                    arrivals = stats.arrivals(),
                    malformed_dropped = stats.malformed_dropped.load(Ordering::Relaxed),
                    journal_dropped = stats.journal_dropped.load(Ordering::Relaxed),
                    sink_dropped = stats.sink_dropped.load(Ordering::Relaxed),
                    queue_depth = stats.queue_depth.load(Ordering::Relaxed),
                    flushed_batches = stats.flushed_batches.load(Ordering::Relaxed),
                    state = ?stats.connection_state(),
                    "pipeline stats"
                );
            }
        })
    };

    tokio::select! {
        res = &mut mqtt_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "ingest loop exited"),
                Err(err) => tracing::error!(error=%err, "ingest task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Drain: stop intake, force a final flush, then give the sink worker a
    // bounded window. Anything left after that is still in the journal.
    mqtt_handle.abort();
    stats_handle.abort();
    let _ = pipeline.flush().await;
    drop(pipeline);
    drop(journal);

    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        let _ = accumulator_handle.await;
        let _ = sink_handle.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("sink did not drain before the grace period; unflushed batches remain recoverable from the journal");
    }

    Ok(())
}
