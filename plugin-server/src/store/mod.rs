use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use common_types::{Person, Team, TeamId};

use crate::actions::{Action, ActionId};
use crate::plugins::types::{
    Plugin, PluginAttachment, PluginCapabilities, PluginConfig, PluginConfigId, PluginErrorRecord,
    PluginId, PluginLogEntry,
};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryActionStore, InMemoryPersonStore, InMemoryPluginStore, InMemoryTeamStore};
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer won a race on a load-bearing unique constraint. The
    /// caller re-reads and retries once; this is a benign signal, not a
    /// failure.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 23505 = postgres unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::UniqueViolation(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Person rows and their distinct-id attachments. The `(team_id,
/// distinct_id)` unique constraint underneath is the arbiter for concurrent
/// attach/create races.
#[async_trait]
pub trait PersonStore: Send + Sync {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError>;

    /// Create a person and attach the given distinct ids atomically.
    async fn create_person(
        &self,
        team_id: TeamId,
        created_at: DateTime<Utc>,
        properties: Map<String, Value>,
        is_identified: bool,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError>;

    async fn add_distinct_id(&self, person: &Person, distinct_id: &str)
        -> Result<(), StoreError>;

    /// Overwrite properties / identified flag / created_at, bumping the row
    /// version. Returns the updated row.
    async fn update_person(
        &self,
        person: &Person,
        properties: Map<String, Value>,
        is_identified: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Person, StoreError>;

    async fn distinct_ids_for_person(&self, person: &Person) -> Result<Vec<String>, StoreError>;

    /// Repoint every distinct id from `from` to `to`; returns the moved ids.
    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError>;

    async fn move_cohort_memberships(&self, from: &Person, to: &Person)
        -> Result<(), StoreError>;

    async fn delete_person(&self, person: &Person) -> Result<(), StoreError>;
}

/// A batch of additive, first-sight team cache updates. Nothing in here is
/// ever removed from the team row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamFirstSight {
    pub team_id: TeamId,
    pub ingested_event: bool,
    pub event_names: Vec<String>,
    pub event_properties: Vec<String>,
    pub event_properties_numerical: Vec<String>,
}

impl TeamFirstSight {
    pub fn is_empty(&self) -> bool {
        !self.ingested_event
            && self.event_names.is_empty()
            && self.event_properties.is_empty()
            && self.event_properties_numerical.is_empty()
    }
}

#[async_trait]
pub trait TeamStore: Send + Sync {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError>;

    /// Apply a first-sight batch additively under a row lock; concurrent
    /// writers coalesce, last writer wins.
    async fn apply_first_sight(&self, update: &TeamFirstSight) -> Result<(), StoreError>;
}

/// The three plugin tables plus the write-backs the lifecycle manager does.
#[async_trait]
pub trait PluginRepository: Send + Sync {
    async fn fetch_plugins(&self) -> Result<Vec<Plugin>, StoreError>;
    async fn fetch_plugin_attachments(&self) -> Result<Vec<PluginAttachment>, StoreError>;
    async fn fetch_plugin_configs(&self) -> Result<Vec<PluginConfig>, StoreError>;

    async fn disable_plugin_config(&self, id: PluginConfigId) -> Result<(), StoreError>;
    async fn record_plugin_error(
        &self,
        id: PluginConfigId,
        error: &PluginErrorRecord,
    ) -> Result<(), StoreError>;
    async fn store_capabilities(
        &self,
        plugin_id: PluginId,
        capabilities: &PluginCapabilities,
    ) -> Result<(), StoreError>;
    async fn append_log_entry(&self, entry: &PluginLogEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn fetch_all_actions(&self) -> Result<Vec<Action>, StoreError>;
    async fn fetch_action(&self, id: ActionId) -> Result<Option<Action>, StoreError>;
}
