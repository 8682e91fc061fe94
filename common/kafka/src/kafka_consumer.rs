use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use serde::de::DeserializeOwned;

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::kafka_producer::apply_tls_config;

/// A consumer subscribed to exactly one topic, with offset *storing* under
/// caller control: offsets are only stored once the caller decides the
/// message is handled, and the auto-committer picks stored offsets up from
/// there.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        client_config.set("enable.auto.offset.store", "false");

        apply_tls_config(&mut client_config, &common_config);

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn json_recv<T>(&self) -> Result<(T, Offset), RecvErr>
    where
        T: DeserializeOwned,
    {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            // We auto-store poison pills, panicking on failure
            offset.store().unwrap();
            return Err(RecvErr::Empty);
        };

        let payload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                // We auto-store poison pills, panicking on failure
                offset.store().unwrap();
                return Err(RecvErr::Serde(e));
            }
        };

        Ok((payload, offset))
    }

    /// Stop fetching from the current assignment. Already-fetched messages
    /// still drain from the local queue, so callers should expect a few more
    /// `json_recv` returns after pausing. Safe to call repeatedly.
    pub fn pause(&self) -> Result<(), KafkaError> {
        let assignment = self.inner.consumer.assignment()?;
        self.inner.consumer.pause(&assignment)
    }

    /// Undo `pause`. Safe to call repeatedly, including when not paused.
    pub fn resume(&self) -> Result<(), KafkaError> {
        let assignment = self.inner.consumer.assignment()?;
        self.inner.consumer.resume(&assignment)
    }

    /// Leave the group, letting the broker rebalance our partitions away.
    pub fn unsubscribe(&self) {
        self.inner.consumer.unsubscribe();
    }
}

/// A handle on one message's offset. Dropping it without calling `store`
/// leaves the offset unstored, which is how failed work gets redelivered
/// after a restart.
pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}
