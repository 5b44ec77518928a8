use crate::error::SinkError;
use crate::record::IngestRecord;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};

/// Downstream storage contract. The pipeline only ever calls this off the
/// broker delivery path; implementations are free to be slow.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Bulk-writes a flushed batch. Must be idempotent under retry.
    async fn save_batch(&self, records: &[IngestRecord]) -> Result<(), SinkError>;

    /// Single-record path for non-batched callers sharing the same storage.
    async fn save_one(&self, record: &IngestRecord) -> Result<(), SinkError>;
}

/// Postgres-backed sink. Expects a `messages` table with a unique
/// `sequence` column; re-delivered rows are skipped so a retried batch is
/// persisted exactly once.
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn save_batch(&self, records: &[IngestRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO messages (sequence, content, device_ref, topic_ref, created_at) ",
        );
        builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.sequence as i64)
                .push_bind(&record.content)
                .push_bind(&record.device_ref)
                .push_bind(&record.topic_ref)
                .push_bind(record.created_at);
        });
        builder.push(" ON CONFLICT DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        let inserted = result.rows_affected() as usize;
        if inserted < records.len() {
            tracing::warn!(
                inserted,
                skipped = records.len().saturating_sub(inserted),
                "skipped duplicate message rows"
            );
        }
        Ok(())
    }

    async fn save_one(&self, record: &IngestRecord) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO messages (sequence, content, device_ref, topic_ref, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(record.sequence as i64)
        .bind(&record.content)
        .bind(&record.device_ref)
        .bind(&record.topic_ref)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory sink capturing batches, with optional injected failures.
    pub struct MemorySink {
        saved: Mutex<Vec<Vec<IngestRecord>>>,
        failures_remaining: AtomicU32,
        pub attempts: AtomicU32,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::failing(0)
        }

        /// Fails the first `failures` save calls, then succeeds.
        pub fn failing(failures: u32) -> Self {
            Self {
                saved: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }
        }

        pub fn saved(&self) -> Vec<Vec<IngestRecord>> {
            self.saved.lock().unwrap().clone()
        }

        fn try_consume_failure(&self) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::Unavailable("injected failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Sink for MemorySink {
        async fn save_batch(&self, records: &[IngestRecord]) -> Result<(), SinkError> {
            self.try_consume_failure()?;
            self.saved.lock().unwrap().push(records.to_vec());
            Ok(())
        }

        async fn save_one(&self, record: &IngestRecord) -> Result<(), SinkError> {
            self.try_consume_failure()?;
            self.saved.lock().unwrap().push(vec![record.clone()]);
            Ok(())
        }
    }
}
