use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_clean_session: bool,
    pub mqtt_topic_filter: String,
    pub mqtt_qos: u8,
    pub mqtt_keepalive_secs: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,

    pub max_batch_size: usize,
    pub max_batch_latency_ms: u64,
    pub max_queue: usize,
    pub flush_queue: usize,

    pub journal_path: PathBuf,

    pub database_url: String,
    pub db_pool_size: u32,
    pub sink_max_attempts: u32,
    pub sink_retry_min_ms: u64,
    pub sink_retry_max_ms: u64,

    pub shutdown_grace_ms: u64,
    pub stats_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mqtt_host = env_string("INGEST_MQTT_HOST", Some("127.0.0.1".to_string()))?;
        let mqtt_port = env_u64("INGEST_MQTT_PORT", Some(1883))? as u16;
        let mqtt_username = env_optional("INGEST_MQTT_USERNAME");
        let mqtt_password = env_optional("INGEST_MQTT_PASSWORD");
        let mqtt_client_id = env_string(
            "INGEST_MQTT_CLIENT_ID",
            Some(format!("broker-ingest-{}", Uuid::new_v4().simple())),
        )?;
        let mqtt_clean_session = env_bool("INGEST_MQTT_CLEAN_SESSION", true);
        let mqtt_topic_filter =
            env_string("INGEST_MQTT_TOPIC_FILTER", Some("ingest/#".to_string()))?;
        let mqtt_qos = env_u64("INGEST_MQTT_QOS", Some(1))? as u8;
        if mqtt_qos > 2 {
            return Err(anyhow!("invalid INGEST_MQTT_QOS: must be 0, 1 or 2"));
        }
        let mqtt_keepalive_secs = env_u64("INGEST_MQTT_KEEPALIVE_SECS", Some(30))?;
        let reconnect_min_ms = env_u64("INGEST_RECONNECT_MIN_MS", Some(500))?.max(1);
        let reconnect_max_ms = env_u64("INGEST_RECONNECT_MAX_MS", Some(30_000))?.max(reconnect_min_ms);

        let max_batch_size = env_u64("INGEST_MAX_BATCH_SIZE", Some(500))?.max(1) as usize;
        let max_batch_latency_ms = env_u64("INGEST_MAX_BATCH_LATENCY_MS", Some(1000))?.max(1);
        let max_queue = env_u64("INGEST_MAX_QUEUE", Some((max_batch_size * 10) as u64))?.max(1) as usize;
        let flush_queue = env_u64("INGEST_FLUSH_QUEUE", Some(4))?.max(1) as usize;

        let journal_path = PathBuf::from(env_string(
            "INGEST_JOURNAL_PATH",
            Some("./ingest-journal.log".to_string()),
        )?);

        let database_url = env::var("INGEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("INGEST_DATABASE_URL or DATABASE_URL is required")?;
        let db_pool_size = env_u64("INGEST_DB_POOL_SIZE", Some(10))? as u32;
        let sink_max_attempts = env_u64("INGEST_SINK_MAX_ATTEMPTS", Some(5))?.max(1) as u32;
        let sink_retry_min_ms = env_u64("INGEST_SINK_RETRY_MIN_MS", Some(200))?.max(1);
        let sink_retry_max_ms =
            env_u64("INGEST_SINK_RETRY_MAX_MS", Some(5_000))?.max(sink_retry_min_ms);

        let shutdown_grace_ms = env_u64("INGEST_SHUTDOWN_GRACE_MS", Some(5_000))?;
        let stats_interval_ms = env_u64("INGEST_STATS_INTERVAL_MS", Some(10_000))?.max(100);

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_clean_session,
            mqtt_topic_filter,
            mqtt_qos,
            mqtt_keepalive_secs,
            reconnect_min_ms,
            reconnect_max_ms,
            max_batch_size,
            max_batch_latency_ms,
            max_queue,
            flush_queue,
            journal_path,
            database_url,
            db_pool_size,
            sink_max_attempts,
            sink_retry_min_ms,
            sink_retry_max_ms,
            shutdown_grace_ms,
            stats_interval_ms,
        })
    }

    /// First literal segment of the subscribed filter, used for topic
    /// resolution. `None` when the filter starts with a wildcard.
    pub fn topic_root(&self) -> Option<&str> {
        let root = self.mqtt_topic_filter.split('/').next().unwrap_or_default();
        if root.is_empty() || root == "#" || root == "+" {
            None
        } else {
            Some(root)
        }
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn max_batch_latency(&self) -> Duration {
        Duration::from_millis(self.max_batch_latency_ms)
    }

    pub fn sink_retry_min(&self) -> Duration {
        Duration::from_millis(self.sink_retry_min_ms)
    }

    pub fn sink_retry_max(&self) -> Duration {
        Duration::from_millis(self.sink_retry_max_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_root_ignores_wildcard_filters() {
        let mut config = test_config();
        assert_eq!(config.topic_root(), Some("ingest"));

        config.mqtt_topic_filter = "#".to_string();
        assert_eq!(config.topic_root(), None);

        config.mqtt_topic_filter = "+/telemetry".to_string();
        assert_eq!(config.topic_root(), None);
    }

    fn test_config() -> Config {
        Config {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "broker-ingest-test".to_string(),
            mqtt_clean_session: true,
            mqtt_topic_filter: "ingest/#".to_string(),
            mqtt_qos: 1,
            mqtt_keepalive_secs: 30,
            reconnect_min_ms: 10,
            reconnect_max_ms: 100,
            max_batch_size: 3,
            max_batch_latency_ms: 1000,
            max_queue: 32,
            flush_queue: 4,
            journal_path: PathBuf::from("./ingest-journal.log"),
            database_url: "postgres://localhost/ingest".to_string(),
            db_pool_size: 2,
            sink_max_attempts: 3,
            sink_retry_min_ms: 10,
            sink_retry_max_ms: 50,
            shutdown_grace_ms: 1000,
            stats_interval_ms: 10_000,
        }
    }
}
