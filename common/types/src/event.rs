use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::team::TeamId;

/// The JSON envelope capture hands off on the ingestion topic. The interesting
/// part of the event lives in `data`, double-encoded, because that is how the
/// capture side has always shipped it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub uuid: Uuid,
    pub distinct_id: String,
    pub ip: String,
    pub site_url: String,
    pub data: String,
    pub team_id: TeamId,
    pub now: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// The nested event JSON inside `RawEvent::data`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Value>,
    #[serde(
        rename = "$set_once",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub set_once: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid event data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("event name is empty")]
    EmptyEventName,
}

/// The working form of an event as it moves through the plugin pipeline and
/// into ingestion. Plugins mutate `properties` freely; everything else is
/// carried through from the envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PluginEvent {
    pub uuid: Uuid,
    pub distinct_id: String,
    pub team_id: TeamId,
    pub event: String,
    pub properties: HashMap<String, Value>,
    pub ip: Option<String>,
    pub site_url: String,
    pub now: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl PluginEvent {
    /// Decode the nested `data` payload and lift the envelope fields onto one
    /// flat event. `$set`/`$set_once` passed at the top level of the payload
    /// win over copies nested in `properties`, matching the capture contract.
    pub fn from_raw(raw: &RawEvent) -> Result<PluginEvent, EventError> {
        let data: EventData = serde_json::from_str(&raw.data)?;

        if data.event.is_empty() {
            return Err(EventError::EmptyEventName);
        }

        let mut properties = data.properties;
        if let Some(set) = data.set {
            properties.insert("$set".to_string(), set);
        }
        if let Some(set_once) = data.set_once {
            properties.insert("$set_once".to_string(), set_once);
        }

        // The sender's IP rides on the envelope, not the event
        let ip = if raw.ip.is_empty() {
            None
        } else {
            properties
                .entry("$ip".to_string())
                .or_insert_with(|| Value::String(raw.ip.clone()));
            Some(raw.ip.clone())
        };

        Ok(PluginEvent {
            uuid: raw.uuid,
            distinct_id: raw.distinct_id.clone(),
            team_id: raw.team_id,
            event: data.event,
            properties,
            ip,
            site_url: raw.site_url.clone(),
            now: raw.now.clone(),
            sent_at: raw.sent_at,
            timestamp: data.timestamp,
            offset: data.offset,
        })
    }

    pub fn is_snapshot(&self) -> bool {
        self.event == "$snapshot"
    }

    /// `$set` as an object, if the event carries one.
    pub fn set_properties(&self) -> Option<&serde_json::Map<String, Value>> {
        self.properties.get("$set").and_then(Value::as_object)
    }

    /// `$set_once` as an object, if the event carries one.
    pub fn set_once_properties(&self) -> Option<&serde_json::Map<String, Value>> {
        self.properties.get("$set_once").and_then(Value::as_object)
    }
}

/// The finished event row, shaped for the columnar store's ingestion topic.
/// Properties are pre-serialized so the row keeps a stable wire shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClickHouseEvent {
    pub uuid: Uuid,
    pub event: String,
    pub properties: String,
    pub timestamp: DateTime<Utc>,
    pub team_id: TeamId,
    pub distinct_id: String,
    #[serde(default)]
    pub elements_chain: String,
    pub created_at: DateTime<Utc>,
}

/// Session recordings skip the event pipeline and land on their own topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecordingEvent {
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub session_id: String,
    pub snapshot_data: Value,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
