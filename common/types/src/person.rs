use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::team::TeamId;

pub type PersonId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: PersonId,
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub created_at: DateTime<Utc>,
    pub properties: Value,
    pub is_identified: bool,
    pub version: Option<i64>,
}

impl Person {
    /// The union of `$set_once`, existing and `$set`, rightmost wins.
    pub fn merged_properties(
        set_once: &Map<String, Value>,
        existing: &Map<String, Value>,
        set: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut out = set_once.clone();
        for (k, v) in existing {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in set {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn properties_object(&self) -> Map<String, Value> {
        self.properties.as_object().cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PersonDistinctId {
    pub id: i64,
    pub person_id: PersonId,
    pub distinct_id: String,
    pub team_id: TeamId,
}
