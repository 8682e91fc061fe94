use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use common_types::TeamId;

pub type PluginId = i32;
pub type PluginConfigId = i32;

/// A plugin row. Exactly one of `archive`, `source` or `url` is normally
/// populated, depending on how the plugin was installed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plugin {
    pub id: PluginId,
    pub name: String,
    pub url: Option<String>,
    pub source: Option<String>,
    pub archive: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
    pub capabilities: Option<Json<PluginCapabilities>>,
}

/// A plugin enabled on a team, with its per-team configuration. Pipelines
/// run configs in ascending `(order, id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PluginConfig {
    pub id: PluginConfigId,
    pub plugin_id: PluginId,
    pub team_id: TeamId,
    pub enabled: bool,
    pub order: i32,
    pub config: Json<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PluginAttachment {
    pub plugin_config_id: PluginConfigId,
    pub key: String,
    pub content_type: String,
    pub file_name: String,
    pub contents: Vec<u8>,
}

/// What a compiled VM turned out to support, persisted back onto the plugin
/// row whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCapabilities {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub scheduled_tasks: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<String>,
}

/// An error attached to a plugin config row, shown to the plugin's owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginErrorRecord {
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_uuid: Option<Uuid>,
}

impl PluginErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            time: Utc::now(),
            stack: None,
            event_uuid: None,
        }
    }

    pub fn for_event(message: impl Into<String>, event_uuid: Uuid) -> Self {
        Self {
            event_uuid: Some(event_uuid),
            ..Self::new(message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntrySource {
    System,
    Plugin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    Info,
    Error,
}

/// One row destined for the plugin log table; capped writes, operator-facing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginLogEntry {
    pub team_id: TeamId,
    pub plugin_id: PluginId,
    pub plugin_config_id: PluginConfigId,
    pub source: LogEntrySource,
    pub type_: LogEntryType,
    pub message: String,
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Why plugin initialization failed. `Retry` is the explicit "try me again"
/// marker plugin setup can raise; anything else is permanent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PluginSetupError {
    #[error("plugin setup asked for retry: {0}")]
    Retry(String),
    #[error("{0}")]
    Fatal(String),
}

/// A plugin method threw while handling an event. Recorded against the
/// config; the pipeline continues with the unchanged event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PluginRuntimeError {
    pub message: String,
}

impl PluginRuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
