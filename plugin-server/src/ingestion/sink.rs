use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::FutureProducer;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext, KafkaProduceError};
use common_kafka::{
    CLICKHOUSE_EVENTS_TOPIC, PERSON_TOPIC, PERSON_UNIQUE_ID_TOPIC,
    SESSION_RECORDING_EVENTS_TOPIC,
};
use common_types::{ClickHouseEvent, Person, SessionRecordingEvent, TeamId};

use crate::metrics_consts::EVENTS_PUBLISHED;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("kafka produce failed: {0}")]
    Kafka(#[from] KafkaProduceError),
}

/// The person row as fanned out to the columnar store's person topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonMessage {
    pub id: Uuid,
    pub team_id: TeamId,
    pub properties: String,
    pub created_at: DateTime<Utc>,
    pub is_identified: bool,
    pub is_deleted: bool,
}

impl PersonMessage {
    fn from_person(person: &Person, is_deleted: bool) -> Self {
        Self {
            id: person.uuid,
            team_id: person.team_id,
            properties: person.properties.to_string(),
            created_at: person.created_at,
            is_identified: person.is_identified,
            is_deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonDistinctIdMessage {
    pub id: i64,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub person_id: Uuid,
}

/// Where finished events and person changes go. Production publishes to the
/// broker; tests capture in memory.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit_event(&self, event: ClickHouseEvent) -> Result<(), SinkError>;
    async fn emit_session_recording(&self, event: SessionRecordingEvent)
        -> Result<(), SinkError>;
    async fn emit_person(&self, person: &Person, is_deleted: bool) -> Result<(), SinkError>;
    async fn emit_person_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: EventSink + ?Sized + Send + Sync> EventSink for Box<T> {
    async fn emit_event(&self, event: ClickHouseEvent) -> Result<(), SinkError> {
        (**self).emit_event(event).await
    }

    async fn emit_session_recording(
        &self,
        event: SessionRecordingEvent,
    ) -> Result<(), SinkError> {
        (**self).emit_session_recording(event).await
    }

    async fn emit_person(&self, person: &Person, is_deleted: bool) -> Result<(), SinkError> {
        (**self).emit_person(person, is_deleted).await
    }

    async fn emit_person_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), SinkError> {
        (**self).emit_person_distinct_id(person, distinct_id).await
    }
}

pub struct KafkaEventSink {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaEventSink {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn emit_event(&self, event: ClickHouseEvent) -> Result<(), SinkError> {
        send_keyed_iter_to_kafka(
            &self.producer,
            CLICKHOUSE_EVENTS_TOPIC,
            |e: &ClickHouseEvent| Some(e.uuid.to_string()),
            [event],
        )
        .await?;
        metrics::counter!(EVENTS_PUBLISHED).increment(1);
        Ok(())
    }

    async fn emit_session_recording(
        &self,
        event: SessionRecordingEvent,
    ) -> Result<(), SinkError> {
        send_keyed_iter_to_kafka(
            &self.producer,
            SESSION_RECORDING_EVENTS_TOPIC,
            |e: &SessionRecordingEvent| Some(e.uuid.to_string()),
            [event],
        )
        .await?;
        Ok(())
    }

    async fn emit_person(&self, person: &Person, is_deleted: bool) -> Result<(), SinkError> {
        send_keyed_iter_to_kafka(
            &self.producer,
            PERSON_TOPIC,
            |p: &PersonMessage| Some(p.id.to_string()),
            [PersonMessage::from_person(person, is_deleted)],
        )
        .await?;
        Ok(())
    }

    async fn emit_person_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), SinkError> {
        send_keyed_iter_to_kafka(
            &self.producer,
            PERSON_UNIQUE_ID_TOPIC,
            |m: &PersonDistinctIdMessage| Some(m.distinct_id.clone()),
            [PersonDistinctIdMessage {
                id: person.id,
                team_id: person.team_id,
                distinct_id: distinct_id.to_string(),
                person_id: person.uuid,
            }],
        )
        .await?;
        Ok(())
    }
}

/// Logs instead of publishing; for local development without a broker.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn emit_event(&self, event: ClickHouseEvent) -> Result<(), SinkError> {
        info!("event: {:?}", event);
        Ok(())
    }

    async fn emit_session_recording(
        &self,
        event: SessionRecordingEvent,
    ) -> Result<(), SinkError> {
        info!("session recording: {:?}", event);
        Ok(())
    }

    async fn emit_person(&self, person: &Person, is_deleted: bool) -> Result<(), SinkError> {
        info!("person (deleted={}): {:?}", is_deleted, person);
        Ok(())
    }

    async fn emit_person_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), SinkError> {
        info!("person distinct id: {} -> {}", distinct_id, person.uuid);
        Ok(())
    }
}

/// Captures everything for assertions.
#[derive(Default)]
pub struct MemorySink {
    pub events: Mutex<Vec<ClickHouseEvent>>,
    pub recordings: Mutex<Vec<SessionRecordingEvent>>,
    pub persons: Mutex<Vec<PersonMessage>>,
    pub distinct_ids: Mutex<Vec<PersonDistinctIdMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit_event(&self, event: ClickHouseEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn emit_session_recording(
        &self,
        event: SessionRecordingEvent,
    ) -> Result<(), SinkError> {
        self.recordings.lock().unwrap().push(event);
        Ok(())
    }

    async fn emit_person(&self, person: &Person, is_deleted: bool) -> Result<(), SinkError> {
        self.persons
            .lock()
            .unwrap()
            .push(PersonMessage::from_person(person, is_deleted));
        Ok(())
    }

    async fn emit_person_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), SinkError> {
        self.distinct_ids.lock().unwrap().push(PersonDistinctIdMessage {
            id: person.id,
            team_id: person.team_id,
            distinct_id: distinct_id.to_string(),
            person_id: person.uuid,
        });
        Ok(())
    }
}
