use common_redis::CustomRedisError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Process-fatal errors. Everything else is recorded and survived: plugin
/// failures land on the offending config, identity races are retried, and
/// worker tasks report failure as a value rather than unwinding.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] envconfig::Error),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] CustomRedisError),
    #[error("consumer loop died: {0}")]
    ConsumerLoop(String),
}

/// Failures while resolving identity or publishing a single event. These are
/// returned to the ingester as a tagged task failure; they never abort the
/// consumer.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("team {0} does not exist")]
    UnknownTeam(i32),
    #[error("event dropped: {0}")]
    InvalidEvent(#[from] common_types::EventError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("publish error: {0}")]
    Sink(#[from] crate::ingestion::sink::SinkError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("identity race persisted after retry")]
    RaceLost,
}
