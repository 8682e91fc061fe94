use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub type TeamId = i32;

/// The slice of the team row ingestion cares about. The three `event_*`
/// columns are additive caches updated on first sight of a new name or
/// property; they only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub uuid: Uuid,
    pub name: String,
    pub api_token: String,
    pub anonymize_ips: bool,
    pub session_recording_opt_in: bool,
    pub ingested_event: bool,
    pub event_names: Json<Vec<String>>,
    pub event_properties: Json<Vec<String>>,
    pub event_properties_numerical: Json<Vec<String>>,
}

impl Team {
    pub fn has_event_name(&self, name: &str) -> bool {
        self.event_names.0.iter().any(|n| n == name)
    }

    pub fn has_event_property(&self, name: &str) -> bool {
        self.event_properties.0.iter().any(|n| n == name)
    }

    pub fn has_numerical_event_property(&self, name: &str) -> bool {
        self.event_properties_numerical.0.iter().any(|n| n == name)
    }
}
