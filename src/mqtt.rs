use crate::config::Config;
use crate::error::ConnectError;
use crate::journal::{JournalEntry, JournalHandle};
use crate::pipeline::{IngestStats, PipelineHandle};
use crate::record::{ConnectionState, IngestRecord, RawArrival};
use anyhow::{anyhow, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration};

/// Runs the broker session for the life of the process: connect, subscribe,
/// poll, and on any connection loss start over after a backoff delay. Only a
/// dead journal writer ends the loop; everything else retries.
pub async fn run_ingest_loop(
    config: Config,
    journal: JournalHandle,
    pipeline: PipelineHandle,
) -> Result<()> {
    let stats = pipeline.stats();
    let next_sequence = AtomicU64::new(1);
    let mut backoff = Backoff::new(config.reconnect_min(), config.reconnect_max());

    loop {
        stats.set_connection_state(ConnectionState::Connecting);

        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        mqttoptions.set_clean_session(config.mqtt_clean_session);
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

        // Each session gets a fresh subscription; a clean-session broker
        // forgets the old one on disconnect.
        if let Err(err) = client
            .subscribe(config.mqtt_topic_filter.clone(), subscribe_qos(config.mqtt_qos))
            .await
        {
            tracing::warn!(error=%err, topic=%config.mqtt_topic_filter, "failed to queue subscription; retrying");
            stats.set_connection_state(ConnectionState::Disconnected);
            sleep(backoff.next_delay()).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        tracing::error!(code=?ack.code, "broker refused session");
                        break;
                    }
                    stats.set_connection_state(ConnectionState::Connected);
                    backoff.reset();
                    tracing::info!(
                        topic=%config.mqtt_topic_filter,
                        qos = config.mqtt_qos,
                        "connected to broker; subscription active"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let arrival = RawArrival {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        received_at: Utc::now(),
                    };
                    handle_arrival(
                        arrival,
                        config.topic_root(),
                        &journal,
                        &pipeline,
                        &next_sequence,
                        &stats,
                    )
                    .await?;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    tracing::warn!("broker sent disconnect");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    match classify_connection_error(&err) {
                        // Credentials or client id are wrong; an operator has
                        // to fix the config, but buffered records still need
                        // a live pipeline, so keep retrying at the cap.
                        rejected @ ConnectError::Rejected(_) => {
                            tracing::error!(error=%rejected, "broker rejected connection")
                        }
                        transport => tracing::warn!(error=%transport, "connection lost"),
                    }
                    break;
                }
            }
        }

        stats.set_connection_state(ConnectionState::Disconnected);
        let delay = backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        sleep(delay).await;
    }
}

/// Single entry point for every inbound publish. Does only fast work:
/// validate, journal (durable before visible), enqueue. Malformed arrivals
/// and per-record journal failures are dropped without stopping ingestion;
/// the returned error is reserved for a dead journal writer.
async fn handle_arrival(
    arrival: RawArrival,
    topic_root: Option<&str>,
    journal: &JournalHandle,
    pipeline: &PipelineHandle,
    next_sequence: &AtomicU64,
    stats: &IngestStats,
) -> Result<()> {
    tracing::trace!(topic=%arrival.topic, qos=?arrival.qos, len = arrival.payload.len(), "publish received");

    let record = match IngestRecord::resolve(&arrival, topic_root, next_sequence) {
        Ok(record) => record,
        Err(reason) => {
            stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error=%reason, topic=%arrival.topic, "dropping malformed arrival");
            return Ok(());
        }
    };

    let entry = JournalEntry::from_record(&record, &arrival.topic);
    if let Err(err) = journal.append(entry).await {
        if err.is_fatal() {
            return Err(anyhow!(err).context("journal writer is gone"));
        }
        stats.journal_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error=%err, sequence = record.sequence, "journal append failed; dropping record");
        return Ok(());
    }

    stats.record_arrival();
    if let Err(err) = pipeline.enqueue(record).await {
        // Accumulator only goes away during shutdown.
        tracing::warn!(error=%err, "accumulator stopped; dropping record");
    }
    Ok(())
}

fn subscribe_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn classify_connection_error(err: &rumqttc::ConnectionError) -> ConnectError {
    match err {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            ConnectError::Rejected(format!("{code:?}"))
        }
        other => ConnectError::Transport(other.to_string()),
    }
}

/// Exponential reconnect delay, doubling from `min` up to `max`. Reset on a
/// successful connect so a stable broker gets quick recoveries.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal;
    use crate::pipeline::BatchCommand;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn subscribe_qos_maps_levels() {
        assert_eq!(subscribe_qos(0), QoS::AtMostOnce);
        assert_eq!(subscribe_qos(1), QoS::AtLeastOnce);
        assert_eq!(subscribe_qos(2), QoS::ExactlyOnce);
    }

    fn arrival(topic: &str, payload: &'static [u8]) -> RawArrival {
        RawArrival {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos: QoS::AtLeastOnce,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn arrival_is_journaled_before_it_is_buffered() {
        let dir = TempDir::new().unwrap();
        let journal_path = dir.path().join("journal.log");
        let journal = journal::spawn_journal_writer(journal_path.clone()).unwrap();
        let stats = Arc::new(IngestStats::new());
        let (tx, mut rx) = mpsc::channel(8);
        let pipeline = PipelineHandle::new(tx, stats.clone());
        let next_sequence = AtomicU64::new(1);

        handle_arrival(
            arrival("ingest/dev-1/temp", b"21.5"),
            Some("ingest"),
            &journal,
            &pipeline,
            &next_sequence,
            &stats,
        )
        .await
        .unwrap();

        let cmd = rx.recv().await.unwrap();
        let BatchCommand::Record(record) = cmd else {
            panic!("expected a record command");
        };
        assert_eq!(record.sequence, 1);
        assert_eq!(record.content, "21.5");
        assert_eq!(stats.arrivals(), 1);

        // The journal already holds the record the accumulator just received.
        drop(journal);
        let entries = journal::replay(&journal_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].topic, "ingest/dev-1/temp");
        assert_eq!(entries[0].content, "21.5");
    }

    #[tokio::test]
    async fn malformed_arrivals_are_dropped_and_counted() {
        let dir = TempDir::new().unwrap();
        let journal = journal::spawn_journal_writer(dir.path().join("journal.log")).unwrap();
        let stats = Arc::new(IngestStats::new());
        let (tx, mut rx) = mpsc::channel(8);
        let pipeline = PipelineHandle::new(tx, stats.clone());
        let next_sequence = AtomicU64::new(1);

        for bad in [
            arrival("ingest/dev-1/temp", b""),
            arrival("other/dev-1/temp", b"x"),
        ] {
            handle_arrival(bad, Some("ingest"), &journal, &pipeline, &next_sequence, &stats)
                .await
                .unwrap();
        }
        handle_arrival(
            arrival("ingest/dev-2/temp", b"ok"),
            Some("ingest"),
            &journal,
            &pipeline,
            &next_sequence,
            &stats,
        )
        .await
        .unwrap();

        assert_eq!(stats.malformed_dropped.load(Ordering::Relaxed), 2);
        assert_eq!(stats.arrivals(), 1);
        let BatchCommand::Record(record) = rx.recv().await.unwrap() else {
            panic!("expected a record command");
        };
        assert_eq!(record.content, "ok");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_journal_writer_is_fatal() {
        let (tx, journal_rx) = mpsc::unbounded_channel();
        drop(journal_rx);
        let journal = JournalHandle::from_sender(tx);
        let stats = Arc::new(IngestStats::new());
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let pipeline = PipelineHandle::new(cmd_tx, stats.clone());
        let next_sequence = AtomicU64::new(1);

        let result = handle_arrival(
            arrival("ingest/dev-1/temp", b"21.5"),
            Some("ingest"),
            &journal,
            &pipeline,
            &next_sequence,
            &stats,
        )
        .await;
        assert!(result.is_err());
    }
}
