use crate::error::ArrivalRejected;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::sync::atomic::{AtomicU64, Ordering};

/// One inbound publish exactly as the broker client delivered it. Built in
/// the poll loop and consumed once.
#[derive(Debug, Clone)]
pub struct RawArrival {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub received_at: DateTime<Utc>,
}

/// A validated arrival, owned by the accumulator until it is handed to the
/// sink. `sequence` is assigned at arrival time and orders both the journal
/// and the flushed batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRecord {
    pub sequence: u64,
    pub content: String,
    pub device_ref: Option<String>,
    pub topic_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IngestRecord {
    /// Validates a raw arrival and derives the stored record from it. The
    /// sequence counter is only consumed on success, so rejected arrivals
    /// leave no gap in the journal.
    ///
    /// `topic_root` is the literal first segment of the subscribed filter;
    /// `None` when the filter starts with a wildcard, in which case every
    /// topic resolves and the leading segment becomes the device reference.
    pub fn resolve(
        arrival: &RawArrival,
        topic_root: Option<&str>,
        next_sequence: &AtomicU64,
    ) -> Result<Self, ArrivalRejected> {
        if arrival.payload.is_empty() {
            return Err(ArrivalRejected::EmptyPayload);
        }
        let content =
            std::str::from_utf8(&arrival.payload).map_err(|_| ArrivalRejected::BinaryPayload)?;

        let mut segments = arrival.topic.split('/');
        let device_ref = match topic_root {
            Some(root) => {
                if segments.next() != Some(root) {
                    return Err(ArrivalRejected::ForeignTopic);
                }
                segments.next()
            }
            None => segments.next(),
        };
        let device_ref = device_ref
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);

        Ok(Self {
            sequence: next_sequence.fetch_add(1, Ordering::Relaxed),
            content: content.to_string(),
            device_ref,
            topic_ref: Some(arrival.topic.clone()),
            created_at: arrival.received_at,
        })
    }
}

/// Broker session state, written only by the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }
}
