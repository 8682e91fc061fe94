use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::sync::{Cache, CacheBuilder};
use serde_json::Value;
use tracing::warn;

use common_types::{PluginEvent, Team, TeamId};

use crate::metrics_consts::TEAM_FIRST_SIGHT_UPDATES;
use crate::store::{StoreError, TeamFirstSight, TeamStore};

/// Cached team lookups plus the additive first-sight caches on the team row
/// (new event names and properties). Updates are coalesced in memory and
/// written out by the flush task, so the hot path never waits on a team row
/// lock.
pub struct TeamManager {
    store: Arc<dyn TeamStore>,
    cache: Cache<TeamId, Option<Team>>,
    pending: Mutex<HashMap<TeamId, TeamFirstSight>>,
}

impl TeamManager {
    pub fn new(store: Arc<dyn TeamStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: CacheBuilder::new(10_000).time_to_live(cache_ttl).build(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError> {
        if let Some(cached) = self.cache.get(&team_id) {
            return Ok(cached);
        }
        let team = self.store.fetch_team(team_id).await?;
        self.cache.insert(team_id, team.clone());
        Ok(team)
    }

    /// Note first sights on this event: a team's first ingested event, a new
    /// event name, a new property, a new numerical property. Additive only.
    pub fn note_event(&self, team: &Team, event: &PluginEvent) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let update = pending.entry(team.id).or_insert_with(|| TeamFirstSight {
            team_id: team.id,
            ..Default::default()
        });

        if !team.ingested_event {
            update.ingested_event = true;
        }

        if !team.has_event_name(&event.event) && !update.event_names.contains(&event.event) {
            update.event_names.push(event.event.clone());
        }

        for (key, value) in &event.properties {
            if !team.has_event_property(key) && !update.event_properties.contains(key) {
                update.event_properties.push(key.clone());
            }
            if matches!(value, Value::Number(_))
                && !team.has_numerical_event_property(key)
                && !update.event_properties_numerical.contains(key)
            {
                update.event_properties_numerical.push(key.clone());
            }
        }

        if update.is_empty() {
            pending.remove(&team.id);
        }
    }

    /// Apply every coalesced first-sight batch. Row-level locking in the
    /// store arbitrates concurrent flushes from other replicas.
    pub async fn flush_queued_writes(&self) -> Result<(), StoreError> {
        let updates: Vec<TeamFirstSight> = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.drain().map(|(_, update)| update).collect()
        };

        for update in updates {
            let team_id = update.team_id;
            metrics::counter!(TEAM_FIRST_SIGHT_UPDATES).increment(1);
            if let Err(e) = self.store.apply_first_sight(&update).await {
                warn!(team_id, "failed to apply first-sight team update: {}", e);
            }
            // Read back fresh on next fetch
            self.cache.invalidate(&team_id);
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        match self.pending.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTeamStore;
    use serde_json::json;
    use uuid::Uuid;

    fn event(name: &str, properties: Value) -> PluginEvent {
        PluginEvent {
            uuid: Uuid::now_v7(),
            distinct_id: "user".to_string(),
            team_id: 2,
            event: name.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            ip: None,
            site_url: "".to_string(),
            now: "2024-01-01T00:00:00Z".to_string(),
            sent_at: None,
            timestamp: None,
            offset: None,
        }
    }

    #[tokio::test]
    async fn first_sight_updates_are_additive_and_coalesced() {
        let store = Arc::new(InMemoryTeamStore::with_team(2));
        let manager = TeamManager::new(store.clone(), Duration::from_secs(30));

        let team = manager.fetch_team(2).await.unwrap().unwrap();
        manager.note_event(&team, &event("purchase", json!({"price": 10, "plan": "free"})));
        manager.note_event(&team, &event("purchase", json!({"price": 20})));
        assert_eq!(manager.pending_count(), 1);

        manager.flush_queued_writes().await.unwrap();
        assert_eq!(manager.pending_count(), 0);

        let team = manager.fetch_team(2).await.unwrap().unwrap();
        assert!(team.ingested_event);
        assert!(team.has_event_name("purchase"));
        assert!(team.has_event_property("price"));
        assert!(team.has_event_property("plan"));
        assert!(team.has_numerical_event_property("price"));
        assert!(!team.has_numerical_event_property("plan"));
    }

    #[tokio::test]
    async fn already_known_names_enqueue_nothing() {
        let store = Arc::new(InMemoryTeamStore::with_team(2));
        let manager = TeamManager::new(store, Duration::from_secs(30));

        let team = manager.fetch_team(2).await.unwrap().unwrap();
        manager.note_event(&team, &event("signup", json!({})));
        manager.flush_queued_writes().await.unwrap();

        let team = manager.fetch_team(2).await.unwrap().unwrap();
        manager.note_event(&team, &event("signup", json!({})));
        assert_eq!(manager.pending_count(), 0);
    }
}
