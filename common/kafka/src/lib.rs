pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;

/// The ingress topic capture hands events off on.
pub const EVENTS_INGESTION_TOPIC: &str = "events_ingestion_handoff";

/// Finished analytics events, keyed by event uuid.
pub const CLICKHOUSE_EVENTS_TOPIC: &str = "clickhouse_events_json";

/// Session recording snapshots, JSON payloads.
pub const SESSION_RECORDING_EVENTS_TOPIC: &str = "clickhouse_session_recording_events";

/// Person row changes, fanned out as JSON.
pub const PERSON_TOPIC: &str = "person";
pub const PERSON_UNIQUE_ID_TOPIC: &str = "person_unique_id";
