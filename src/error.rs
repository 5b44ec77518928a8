use thiserror::Error;

/// Classified broker connection failure. Transport failures are always
/// retried by the connection loop; a rejection means the broker refused the
/// session itself (bad credentials, bad client id) and is logged louder so an
/// operator notices, but the loop keeps retrying rather than exiting.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// A single journal append failed, or the writer thread is gone.
#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("journal write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("journal writer stopped")]
    Closed,
}

impl LogWriteError {
    /// Per-record failures drop the record and keep ingesting; a stopped
    /// writer means local storage is unusable and must surface to the
    /// operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogWriteError::Closed)
    }
}

/// Downstream storage failure; retried per batch with bounded backoff.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database write failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Why an inbound publish was dropped before entering the pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArrivalRejected {
    #[error("empty payload")]
    EmptyPayload,
    #[error("payload is not valid utf-8")]
    BinaryPayload,
    #[error("topic outside the configured ingest root")]
    ForeignTopic,
}
