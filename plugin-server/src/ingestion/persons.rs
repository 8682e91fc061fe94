use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use common_types::{Person, PluginEvent, TeamId};

use crate::error::IngestError;
use crate::ingestion::sink::EventSink;
use crate::metrics_consts::{IDENTITY_RACES, PERSONS_CREATED, PERSONS_MERGED};
use crate::store::{PersonStore, StoreError};

/// Resolves events to person rows: creation on first sight, `$identify` /
/// `$create_alias` handling, and merge of aliased identities. All attach
/// and create paths treat a unique-constraint violation as "another worker
/// got there first" and retry exactly once from the top.
pub struct PersonResolver {
    store: Arc<dyn PersonStore>,
    sink: Arc<dyn EventSink>,
}

impl PersonResolver {
    pub fn new(store: Arc<dyn PersonStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    pub async fn handle_event(
        &self,
        event: &PluginEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        match event.event.as_str() {
            "$identify" => {
                if let Some(anon) = event
                    .properties
                    .get("$anon_distinct_id")
                    .and_then(Value::as_str)
                {
                    self.alias(event.team_id, anon, &event.distinct_id, timestamp)
                        .await?;
                }
                self.apply_identify(event, timestamp).await?;
            }
            "$create_alias" => {
                if let Some(alias) = event.properties.get("alias").and_then(Value::as_str) {
                    self.alias(event.team_id, alias, &event.distinct_id, timestamp)
                        .await?;
                } else {
                    warn!("$create_alias event without alias property");
                }
            }
            _ => {
                self.ensure_person(event.team_id, &event.distinct_id, timestamp)
                    .await?;
            }
        }
        Ok(())
    }

    /// The person behind a distinct id, created on first sight. A lost
    /// create race resolves by re-reading the winner's row.
    pub async fn ensure_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Person, IngestError> {
        if let Some(person) = self.store.person_by_distinct_id(team_id, distinct_id).await? {
            return Ok(person);
        }

        match self
            .store
            .create_person(team_id, timestamp, Map::new(), false, &[distinct_id.to_string()])
            .await
        {
            Ok(person) => {
                metrics::counter!(PERSONS_CREATED).increment(1);
                self.sink.emit_person(&person, false).await?;
                self.sink.emit_person_distinct_id(&person, distinct_id).await?;
                Ok(person)
            }
            Err(StoreError::UniqueViolation(_)) => {
                metrics::counter!(IDENTITY_RACES).increment(1);
                self.store
                    .person_by_distinct_id(team_id, distinct_id)
                    .await?
                    .ok_or(IngestError::RaceLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `$set`/`$set_once` to the canonical person and mark it
    /// identified.
    async fn apply_identify(
        &self,
        event: &PluginEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let person = self
            .ensure_person(event.team_id, &event.distinct_id, timestamp)
            .await?;

        let set = event.set_properties().cloned().unwrap_or_default();
        let set_once = event.set_once_properties().cloned().unwrap_or_default();
        let merged = Person::merged_properties(&set_once, &person.properties_object(), &set);

        let updated = self
            .store
            .update_person(&person, merged, true, person.created_at)
            .await?;
        self.sink.emit_person(&updated, false).await?;
        Ok(())
    }

    /// Declare `previous` and `current` equivalent within the team. One
    /// retry from the top covers every race: after a single violation at
    /// least one of the two persons is guaranteed present.
    pub async fn alias(
        &self,
        team_id: TeamId,
        previous: &str,
        current: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        if previous == current {
            return Ok(());
        }
        match self.try_alias(team_id, previous, current, timestamp).await {
            Err(IngestError::Store(StoreError::UniqueViolation(_))) => {
                metrics::counter!(IDENTITY_RACES).increment(1);
                match self.try_alias(team_id, previous, current, timestamp).await {
                    Err(IngestError::Store(StoreError::UniqueViolation(_))) => {
                        Err(IngestError::RaceLost)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_alias(
        &self,
        team_id: TeamId,
        previous: &str,
        current: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let person_a = self.store.person_by_distinct_id(team_id, previous).await?;
        let person_b = self.store.person_by_distinct_id(team_id, current).await?;

        match (person_a, person_b) {
            (Some(a), None) => {
                self.store.add_distinct_id(&a, current).await?;
                self.sink.emit_person_distinct_id(&a, current).await?;
                Ok(())
            }
            (None, Some(b)) => {
                self.store.add_distinct_id(&b, previous).await?;
                self.sink.emit_person_distinct_id(&b, previous).await?;
                Ok(())
            }
            (None, None) => {
                let person = self
                    .store
                    .create_person(
                        team_id,
                        timestamp,
                        Map::new(),
                        false,
                        &[previous.to_string(), current.to_string()],
                    )
                    .await?;
                metrics::counter!(PERSONS_CREATED).increment(1);
                self.sink.emit_person(&person, false).await?;
                self.sink.emit_person_distinct_id(&person, previous).await?;
                self.sink.emit_person_distinct_id(&person, current).await?;
                Ok(())
            }
            (Some(a), Some(b)) if a.id != b.id => self.merge(a, b).await,
            _ => Ok(()), // already the same person
        }
    }

    /// Merge A into B: B-wins property union, keep the earlier created_at,
    /// repoint distinct ids and cohort memberships, delete A.
    async fn merge(&self, from: Person, into: Person) -> Result<(), IngestError> {
        let merged = Person::merged_properties(
            &Map::new(),
            &from.properties_object(),
            &into.properties_object(),
        );
        let created_at = from.created_at.min(into.created_at);

        let updated = self
            .store
            .update_person(&into, merged, true, created_at)
            .await?;

        let moved = self.store.move_distinct_ids(&from, &updated).await?;
        self.store.move_cohort_memberships(&from, &updated).await?;
        self.store.delete_person(&from).await?;

        metrics::counter!(PERSONS_MERGED).increment(1);
        self.sink.emit_person(&updated, false).await?;
        for distinct_id in &moved {
            self.sink.emit_person_distinct_id(&updated, distinct_id).await?;
        }
        self.sink.emit_person(&from, true).await?;
        Ok(())
    }
}
