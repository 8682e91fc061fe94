use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use common_types::timestamp::parse_event_timestamp;
use common_types::{ClickHouseEvent, PluginEvent, SessionRecordingEvent};

use crate::error::IngestError;
use crate::ingestion::sink::EventSink;
use crate::ingestion::teams::TeamManager;
use crate::ingestion::PersonResolver;
use crate::metrics_consts::EVENT_PIPELINE_TIME;

/// The event processor: coerce the timestamp, resolve identity, normalize
/// and publish. Runs after the plugin pipeline; an event reaching here has
/// survived every plugin.
pub struct EventProcessor {
    teams: Arc<TeamManager>,
    persons: PersonResolver,
    sink: Arc<dyn EventSink>,
}

impl EventProcessor {
    pub fn new(teams: Arc<TeamManager>, persons: PersonResolver, sink: Arc<dyn EventSink>) -> Self {
        Self {
            teams,
            persons,
            sink,
        }
    }

    pub async fn process_event(
        &self,
        event: &PluginEvent,
    ) -> Result<Option<ClickHouseEvent>, IngestError> {
        let timer = common_metrics::timing_guard(EVENT_PIPELINE_TIME, &[]);

        let team = self
            .teams
            .fetch_team(event.team_id)
            .await?
            .ok_or(IngestError::UnknownTeam(event.team_id))?;

        let now = Utc::now();
        let timestamp =
            parse_event_timestamp(event.timestamp.as_deref(), event.offset, event.sent_at, now);

        // Session recordings skip identity and go to their own topic
        if event.is_snapshot() {
            let session_id = event
                .properties
                .get("$session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let snapshot_data = event
                .properties
                .get("$snapshot_data")
                .cloned()
                .unwrap_or(Value::Null);
            self.sink
                .emit_session_recording(SessionRecordingEvent {
                    uuid: event.uuid,
                    team_id: event.team_id,
                    distinct_id: event.distinct_id.clone(),
                    session_id,
                    snapshot_data,
                    timestamp,
                    created_at: now,
                })
                .await?;
            timer.label("kind", "snapshot").fin();
            return Ok(None);
        }

        self.persons.handle_event(event, timestamp).await?;
        self.teams.note_event(&team, event);

        let mut properties = event.properties.clone();
        if team.anonymize_ips {
            properties.remove("$ip");
        }
        let elements_chain = properties
            .remove("$elements_chain")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();

        let finished = ClickHouseEvent {
            uuid: event.uuid,
            event: event.event.clone(),
            properties: serde_json::to_string(&properties)?,
            timestamp,
            team_id: event.team_id,
            distinct_id: event.distinct_id.clone(),
            elements_chain,
            created_at: now,
        };

        self.sink.emit_event(finished.clone()).await?;
        timer.label("kind", "event").fin();
        Ok(Some(finished))
    }

    pub async fn flush_queued_writes(&self) -> Result<(), IngestError> {
        self.teams.flush_queued_writes().await?;
        Ok(())
    }
}
