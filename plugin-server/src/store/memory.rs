use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use uuid::Uuid;

use common_types::{Person, PersonId, Team, TeamId};

use crate::actions::{Action, ActionId};
use crate::plugins::types::{
    Plugin, PluginAttachment, PluginCapabilities, PluginConfig, PluginConfigId, PluginErrorRecord,
    PluginId, PluginLogEntry,
};
use crate::store::{
    ActionRepository, PersonStore, PluginRepository, StoreError, TeamFirstSight, TeamStore,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct PersonTables {
    next_person_id: PersonId,
    persons: HashMap<PersonId, Person>,
    // (team_id, distinct_id) -> person_id; the map key IS the unique constraint
    distinct_ids: HashMap<(TeamId, String), PersonId>,
    cohort_memberships: Vec<(i32, PersonId)>,
}

/// The person tables, with the `(team_id, distinct_id)` unique constraint
/// enforced the way postgres would: a violating insert fails the whole call.
#[derive(Default)]
pub struct InMemoryPersonStore {
    tables: Mutex<PersonTables>,
}

impl InMemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn person_count(&self, team_id: TeamId) -> usize {
        lock(&self.tables)
            .persons
            .values()
            .filter(|p| p.team_id == team_id)
            .count()
    }

    pub fn distinct_ids_of(&self, person_id: PersonId) -> Vec<String> {
        let tables = lock(&self.tables);
        let mut ids: Vec<String> = tables
            .distinct_ids
            .iter()
            .filter(|(_, pid)| **pid == person_id)
            .map(|((_, distinct_id), _)| distinct_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn add_cohort_membership(&self, cohort_id: i32, person_id: PersonId) {
        lock(&self.tables)
            .cohort_memberships
            .push((cohort_id, person_id));
    }

    pub fn cohort_members(&self, cohort_id: i32) -> Vec<PersonId> {
        lock(&self.tables)
            .cohort_memberships
            .iter()
            .filter(|(c, _)| *c == cohort_id)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl PersonStore for InMemoryPersonStore {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let tables = lock(&self.tables);
        Ok(tables
            .distinct_ids
            .get(&(team_id, distinct_id.to_string()))
            .and_then(|person_id| tables.persons.get(person_id))
            .cloned())
    }

    async fn create_person(
        &self,
        team_id: TeamId,
        created_at: DateTime<Utc>,
        properties: Map<String, Value>,
        is_identified: bool,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError> {
        let mut tables = lock(&self.tables);

        for distinct_id in distinct_ids {
            if tables
                .distinct_ids
                .contains_key(&(team_id, distinct_id.clone()))
            {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate key ({team_id}, {distinct_id})"
                )));
            }
        }

        tables.next_person_id += 1;
        let person = Person {
            id: tables.next_person_id,
            uuid: Uuid::now_v7(),
            team_id,
            created_at,
            properties: Value::Object(properties),
            is_identified,
            version: Some(0),
        };
        tables.persons.insert(person.id, person.clone());
        for distinct_id in distinct_ids {
            tables
                .distinct_ids
                .insert((team_id, distinct_id.clone()), person.id);
        }
        Ok(person)
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        let key = (person.team_id, distinct_id.to_string());
        if tables.distinct_ids.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key ({}, {distinct_id})",
                person.team_id
            )));
        }
        tables.distinct_ids.insert(key, person.id);
        Ok(())
    }

    async fn update_person(
        &self,
        person: &Person,
        properties: Map<String, Value>,
        is_identified: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Person, StoreError> {
        let mut tables = lock(&self.tables);
        let row = tables
            .persons
            .get_mut(&person.id)
            .ok_or_else(|| StoreError::Database(sqlx::Error::RowNotFound))?;
        row.properties = Value::Object(properties);
        row.is_identified = is_identified;
        row.created_at = created_at;
        row.version = Some(row.version.unwrap_or(0) + 1);
        Ok(row.clone())
    }

    async fn distinct_ids_for_person(&self, person: &Person) -> Result<Vec<String>, StoreError> {
        Ok(self.distinct_ids_of(person.id))
    }

    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError> {
        let mut tables = lock(&self.tables);
        let mut moved = Vec::new();
        for ((team_id, distinct_id), person_id) in tables.distinct_ids.iter_mut() {
            if *person_id == from.id && *team_id == from.team_id {
                *person_id = to.id;
                moved.push(distinct_id.clone());
            }
        }
        moved.sort();
        Ok(moved)
    }

    async fn move_cohort_memberships(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        for (_, person_id) in tables.cohort_memberships.iter_mut() {
            if *person_id == from.id {
                *person_id = to.id;
            }
        }
        Ok(())
    }

    async fn delete_person(&self, person: &Person) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        tables.persons.remove(&person.id);
        tables
            .distinct_ids
            .retain(|_, person_id| *person_id != person.id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTeamStore {
    teams: Mutex<HashMap<TeamId, Team>>,
}

impl InMemoryTeamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(team_id: TeamId) -> Self {
        let store = Self::new();
        store.insert_team(Team {
            id: team_id,
            uuid: Uuid::now_v7(),
            name: format!("Team {team_id}"),
            api_token: format!("token-{team_id}"),
            anonymize_ips: false,
            session_recording_opt_in: true,
            ingested_event: false,
            event_names: Json(Vec::new()),
            event_properties: Json(Vec::new()),
            event_properties_numerical: Json(Vec::new()),
        });
        store
    }

    pub fn insert_team(&self, team: Team) {
        lock(&self.teams).insert(team.id, team);
    }
}

#[async_trait]
impl TeamStore for InMemoryTeamStore {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError> {
        Ok(lock(&self.teams).get(&team_id).cloned())
    }

    async fn apply_first_sight(&self, update: &TeamFirstSight) -> Result<(), StoreError> {
        let mut teams = lock(&self.teams);
        let Some(team) = teams.get_mut(&update.team_id) else {
            return Ok(());
        };
        team.ingested_event |= update.ingested_event;
        let merge = |existing: &mut Vec<String>, new: &[String]| {
            for name in new {
                if !existing.contains(name) {
                    existing.push(name.clone());
                }
            }
        };
        merge(&mut team.event_names.0, &update.event_names);
        merge(&mut team.event_properties.0, &update.event_properties);
        merge(
            &mut team.event_properties_numerical.0,
            &update.event_properties_numerical,
        );
        Ok(())
    }
}

#[derive(Default)]
struct PluginTables {
    plugins: Vec<Plugin>,
    attachments: Vec<PluginAttachment>,
    configs: Vec<PluginConfig>,
    errors: HashMap<PluginConfigId, PluginErrorRecord>,
    disabled: Vec<PluginConfigId>,
    capabilities: HashMap<PluginId, PluginCapabilities>,
    log_entries: Vec<PluginLogEntry>,
}

#[derive(Default)]
pub struct InMemoryPluginStore {
    tables: Mutex<PluginTables>,
}

impl InMemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&self, plugin: Plugin) {
        lock(&self.tables).plugins.push(plugin);
    }

    pub fn add_config(&self, config: PluginConfig) {
        lock(&self.tables).configs.push(config);
    }

    pub fn add_attachment(&self, attachment: PluginAttachment) {
        lock(&self.tables).attachments.push(attachment);
    }

    pub fn error_for(&self, config_id: PluginConfigId) -> Option<PluginErrorRecord> {
        lock(&self.tables).errors.get(&config_id).cloned()
    }

    pub fn is_disabled(&self, config_id: PluginConfigId) -> bool {
        lock(&self.tables).disabled.contains(&config_id)
    }

    pub fn capabilities_of(&self, plugin_id: PluginId) -> Option<PluginCapabilities> {
        lock(&self.tables).capabilities.get(&plugin_id).cloned()
    }

    pub fn log_entries(&self) -> Vec<PluginLogEntry> {
        lock(&self.tables).log_entries.clone()
    }
}

#[async_trait]
impl PluginRepository for InMemoryPluginStore {
    async fn fetch_plugins(&self) -> Result<Vec<Plugin>, StoreError> {
        Ok(lock(&self.tables).plugins.clone())
    }

    async fn fetch_plugin_attachments(&self) -> Result<Vec<PluginAttachment>, StoreError> {
        Ok(lock(&self.tables).attachments.clone())
    }

    async fn fetch_plugin_configs(&self) -> Result<Vec<PluginConfig>, StoreError> {
        Ok(lock(&self.tables).configs.clone())
    }

    async fn disable_plugin_config(&self, id: PluginConfigId) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        if let Some(config) = tables.configs.iter_mut().find(|c| c.id == id) {
            config.enabled = false;
        }
        tables.disabled.push(id);
        Ok(())
    }

    async fn record_plugin_error(
        &self,
        id: PluginConfigId,
        error: &PluginErrorRecord,
    ) -> Result<(), StoreError> {
        lock(&self.tables).errors.insert(id, error.clone());
        Ok(())
    }

    async fn store_capabilities(
        &self,
        plugin_id: PluginId,
        capabilities: &PluginCapabilities,
    ) -> Result<(), StoreError> {
        lock(&self.tables)
            .capabilities
            .insert(plugin_id, capabilities.clone());
        Ok(())
    }

    async fn append_log_entry(&self, entry: &PluginLogEntry) -> Result<(), StoreError> {
        lock(&self.tables).log_entries.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryActionStore {
    actions: Mutex<HashMap<ActionId, Action>>,
}

impl InMemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_action(&self, action: Action) {
        lock(&self.actions).insert(action.id, action);
    }

    pub fn remove_action(&self, id: ActionId) {
        lock(&self.actions).remove(&id);
    }
}

#[async_trait]
impl ActionRepository for InMemoryActionStore {
    async fn fetch_all_actions(&self) -> Result<Vec<Action>, StoreError> {
        Ok(lock(&self.actions).values().cloned().collect())
    }

    async fn fetch_action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        Ok(lock(&self.actions).get(&id).cloned())
    }
}
