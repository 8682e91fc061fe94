pub const EVENTS_RECEIVED: &str = "plugin_server_events_received";
pub const EVENTS_DROPPED: &str = "plugin_server_events_dropped";
pub const EVENTS_PUBLISHED: &str = "plugin_server_events_published";
pub const EVENT_PIPELINE_TIME: &str = "plugin_server_event_pipeline_ms";

pub const CONSUMER_PAUSED: &str = "plugin_server_consumer_paused";
pub const TASKS_IN_FLIGHT: &str = "plugin_server_tasks_in_flight";

pub const TASKS_COMPLETED: &str = "plugin_server_tasks_completed";
pub const TASKS_FAILED: &str = "plugin_server_tasks_failed";
pub const TASKS_TIMED_OUT: &str = "plugin_server_tasks_timed_out";
pub const TASK_EXECUTION_TIME: &str = "plugin_server_task_execution_ms";

pub const PLUGIN_PROCESS_EVENT_TIME: &str = "plugin_server_plugin_process_event_ms";
pub const PLUGIN_ERRORS: &str = "plugin_server_plugin_errors";
pub const PLUGIN_EVENTS_DROPPED: &str = "plugin_server_plugin_events_dropped";
pub const PLUGIN_SETUP_RETRIES: &str = "plugin_server_plugin_setup_retries";
pub const PLUGINS_DISABLED: &str = "plugin_server_plugins_disabled";

pub const PERSONS_CREATED: &str = "plugin_server_persons_created";
pub const PERSONS_MERGED: &str = "plugin_server_persons_merged";
pub const IDENTITY_RACES: &str = "plugin_server_identity_races";

pub const SCHEDULER_LEADER: &str = "plugin_server_scheduler_leader";
pub const SCHEDULED_TASKS_SUBMITTED: &str = "plugin_server_scheduled_tasks_submitted";

pub const TEAM_FIRST_SIGHT_UPDATES: &str = "plugin_server_team_first_sight_updates";
