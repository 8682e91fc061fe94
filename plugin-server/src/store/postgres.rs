use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use common_types::{Person, Team, TeamId};

use crate::actions::{Action, ActionId, ActionStep, PropertyFilter, UrlMatching};
use crate::plugins::types::{
    LogEntrySource, LogEntryType, Plugin, PluginAttachment, PluginCapabilities, PluginConfig,
    PluginConfigId, PluginErrorRecord, PluginId, PluginLogEntry,
};
use crate::store::{
    ActionRepository, PersonStore, PluginRepository, StoreError, TeamFirstSight, TeamStore,
};

const PERSON_COLUMNS: &str = "id, uuid, team_id, created_at, properties, is_identified, version";

/// All four storage concerns over the shared connection pool. Queries are
/// runtime-checked; the relational store owns the constraints this service
/// leans on (unique `(team_id, distinct_id)` above all).
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersonStore for PostgresStore {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let person = sqlx::query_as::<_, Person>(
            r#"
            SELECT pp.id, pp.uuid, pp.team_id, pp.created_at, pp.properties, pp.is_identified, pp.version
            FROM posthog_person pp
            INNER JOIN posthog_persondistinctid pdi ON pp.id = pdi.person_id
            WHERE pdi.distinct_id = $1
                AND pdi.team_id = $2
                AND pp.team_id = $2
            LIMIT 1
            "#,
        )
        .bind(distinct_id)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(person)
    }

    async fn create_person(
        &self,
        team_id: TeamId,
        created_at: DateTime<Utc>,
        properties: Map<String, Value>,
        is_identified: bool,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError> {
        let mut tx = self.pool.begin().await?;

        let person = sqlx::query_as::<_, Person>(&format!(
            r#"
            INSERT INTO posthog_person (uuid, team_id, created_at, properties, is_identified, version)
            VALUES ($1, $2, $3, $4, $5, 0)
            RETURNING {PERSON_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(team_id)
        .bind(created_at)
        .bind(Value::Object(properties))
        .bind(is_identified)
        .fetch_one(&mut *tx)
        .await?;

        for distinct_id in distinct_ids {
            sqlx::query(
                "INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id) VALUES ($1, $2, $3)",
            )
            .bind(distinct_id)
            .bind(person.id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(person)
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id) VALUES ($1, $2, $3)",
        )
        .bind(distinct_id)
        .bind(person.id)
        .bind(person.team_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_person(
        &self,
        person: &Person,
        properties: Map<String, Value>,
        is_identified: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Person, StoreError> {
        let updated = sqlx::query_as::<_, Person>(&format!(
            r#"
            UPDATE posthog_person
            SET properties = $1, is_identified = $2, created_at = $3, version = COALESCE(version, 0) + 1
            WHERE id = $4 AND team_id = $5
            RETURNING {PERSON_COLUMNS}
            "#
        ))
        .bind(Value::Object(properties))
        .bind(is_identified)
        .bind(created_at)
        .bind(person.id)
        .bind(person.team_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn distinct_ids_for_person(&self, person: &Person) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT distinct_id FROM posthog_persondistinctid WHERE person_id = $1 AND team_id = $2 ORDER BY id",
        )
        .bind(person.id)
        .bind(person.team_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError> {
        let moved = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posthog_persondistinctid
            SET person_id = $1
            WHERE person_id = $2 AND team_id = $3
            RETURNING distinct_id
            "#,
        )
        .bind(to.id)
        .bind(from.id)
        .bind(from.team_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(moved)
    }

    async fn move_cohort_memberships(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE posthog_cohortpeople SET person_id = $1 WHERE person_id = $2")
            .bind(to.id)
            .bind(from.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_person(&self, person: &Person) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM posthog_persondistinctid WHERE person_id = $1 AND team_id = $2")
            .bind(person.id)
            .bind(person.team_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posthog_person WHERE id = $1 AND team_id = $2")
            .bind(person.id)
            .bind(person.team_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TeamCacheRow {
    ingested_event: bool,
    event_names: Json<Vec<String>>,
    event_properties: Json<Vec<String>>,
    event_properties_numerical: Json<Vec<String>>,
}

#[async_trait]
impl TeamStore for PostgresStore {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError> {
        let team = sqlx::query_as::<_, Team>(
            r#"
            SELECT id, uuid, name, api_token, anonymize_ips, session_recording_opt_in,
                   ingested_event, event_names, event_properties, event_properties_numerical
            FROM posthog_team
            WHERE id = $1
            "#,
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(team)
    }

    async fn apply_first_sight(&self, update: &TeamFirstSight) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock arbitrates concurrent first-sight writers; last one wins
        let Some(row) = sqlx::query_as::<_, TeamCacheRow>(
            r#"
            SELECT ingested_event, event_names, event_properties, event_properties_numerical
            FROM posthog_team WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(update.team_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(());
        };

        let merge = |mut existing: Vec<String>, new: &[String]| {
            for name in new {
                if !existing.contains(name) {
                    existing.push(name.clone());
                }
            }
            existing
        };

        sqlx::query(
            r#"
            UPDATE posthog_team
            SET ingested_event = $1, event_names = $2, event_properties = $3,
                event_properties_numerical = $4
            WHERE id = $5
            "#,
        )
        .bind(row.ingested_event || update.ingested_event)
        .bind(Json(merge(row.event_names.0, &update.event_names)))
        .bind(Json(merge(row.event_properties.0, &update.event_properties)))
        .bind(Json(merge(
            row.event_properties_numerical.0,
            &update.event_properties_numerical,
        )))
        .bind(update.team_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PluginRepository for PostgresStore {
    async fn fetch_plugins(&self) -> Result<Vec<Plugin>, StoreError> {
        let plugins = sqlx::query_as::<_, Plugin>(
            "SELECT id, name, url, source, archive, updated_at, capabilities FROM posthog_plugin",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plugins)
    }

    async fn fetch_plugin_attachments(&self) -> Result<Vec<PluginAttachment>, StoreError> {
        let attachments = sqlx::query_as::<_, PluginAttachment>(
            r#"
            SELECT plugin_config_id, key, content_type, file_name, contents
            FROM posthog_pluginattachment
            WHERE plugin_config_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(attachments)
    }

    async fn fetch_plugin_configs(&self) -> Result<Vec<PluginConfig>, StoreError> {
        let configs = sqlx::query_as::<_, PluginConfig>(
            r#"
            SELECT id, plugin_id, team_id, enabled, "order", config, updated_at
            FROM posthog_pluginconfig
            WHERE team_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(configs)
    }

    async fn disable_plugin_config(&self, id: PluginConfigId) -> Result<(), StoreError> {
        sqlx::query("UPDATE posthog_pluginconfig SET enabled = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_plugin_error(
        &self,
        id: PluginConfigId,
        error: &PluginErrorRecord,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE posthog_pluginconfig SET error = $1 WHERE id = $2")
            .bind(Json(error))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_capabilities(
        &self,
        plugin_id: PluginId,
        capabilities: &PluginCapabilities,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE posthog_plugin SET capabilities = $1 WHERE id = $2")
            .bind(Json(capabilities))
            .bind(plugin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log_entry(&self, entry: &PluginLogEntry) -> Result<(), StoreError> {
        let source = match entry.source {
            LogEntrySource::System => "SYSTEM",
            LogEntrySource::Plugin => "PLUGIN",
        };
        let type_ = match entry.type_ {
            LogEntryType::Info => "INFO",
            LogEntryType::Error => "ERROR",
        };
        sqlx::query(
            r#"
            INSERT INTO posthog_pluginlogentry
                (id, team_id, plugin_id, plugin_config_id, timestamp, source, type, message, instance_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(entry.team_id)
        .bind(entry.plugin_id)
        .bind(entry.plugin_config_id)
        .bind(entry.timestamp)
        .bind(source)
        .bind(type_)
        .bind(&entry.message)
        .bind(entry.instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: ActionId,
    team_id: TeamId,
    name: String,
    deleted: bool,
}

#[derive(sqlx::FromRow)]
struct ActionStepRow {
    id: i32,
    action_id: ActionId,
    event: Option<String>,
    url: Option<String>,
    url_matching: Option<String>,
    tag_name: Option<String>,
    text: Option<String>,
    href: Option<String>,
    properties: Option<Json<Vec<PropertyFilter>>>,
}

impl ActionStepRow {
    fn into_step(self) -> ActionStep {
        let url_matching = self.url_matching.as_deref().and_then(|m| match m {
            "contains" => Some(UrlMatching::Contains),
            "regex" => Some(UrlMatching::Regex),
            "exact" => Some(UrlMatching::Exact),
            _ => None,
        });
        ActionStep {
            id: self.id,
            action_id: self.action_id,
            event: self.event,
            url: self.url,
            url_matching,
            tag_name: self.tag_name,
            text: self.text,
            href: self.href,
            properties: self.properties.map(|p| p.0).unwrap_or_default(),
        }
    }
}

impl PostgresStore {
    async fn assemble_actions(&self, rows: Vec<ActionRow>) -> Result<Vec<Action>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ActionId> = rows.iter().map(|r| r.id).collect();
        let steps = sqlx::query_as::<_, ActionStepRow>(
            r#"
            SELECT id, action_id, event, url, url_matching, tag_name, text, href, properties
            FROM posthog_actionstep
            WHERE action_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut actions: Vec<Action> = rows
            .into_iter()
            .map(|r| Action {
                id: r.id,
                team_id: r.team_id,
                name: r.name,
                deleted: r.deleted,
                steps: Vec::new(),
            })
            .collect();

        for step in steps {
            if let Some(action) = actions.iter_mut().find(|a| a.id == step.action_id) {
                action.steps.push(step.into_step());
            }
        }
        Ok(actions)
    }
}

#[async_trait]
impl ActionRepository for PostgresStore {
    async fn fetch_all_actions(&self) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, team_id, name, deleted FROM posthog_action WHERE deleted = false",
        )
        .fetch_all(&self.pool)
        .await?;
        self.assemble_actions(rows).await
    }

    async fn fetch_action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, team_id, name, deleted FROM posthog_action WHERE id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.assemble_actions(rows).await?.into_iter().next())
    }
}
