#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::types::Json;
use uuid::Uuid;

use common_redis::MockRedisClient;
use common_types::PluginEvent;

use plugin_server::ingestion::{EventProcessor, MemorySink, PersonResolver, TeamManager};
use plugin_server::jobs::JobQueue;
use plugin_server::plugins::builtin::default_library;
use plugin_server::plugins::runtime::{
    process_event_fn, NativePluginLibrary, PluginFactory, PluginMeta, PluginModule, PluginVm,
};
use plugin_server::plugins::types::{Plugin, PluginConfig, PluginRuntimeError, PluginSetupError};
use plugin_server::plugins::PluginRegistry;
use plugin_server::store::{
    InMemoryActionStore, InMemoryPersonStore, InMemoryPluginStore, InMemoryTeamStore,
};
use plugin_server::worker::{WorkerContext, WorkerPool};

pub const TEAM_ID: i32 = 2;

/// In-memory stores, a scripted redis, and a captured sink wired the same
/// way `AppContext` wires production.
pub struct Harness {
    pub plugin_store: Arc<InMemoryPluginStore>,
    pub person_store: Arc<InMemoryPersonStore>,
    pub team_store: Arc<InMemoryTeamStore>,
    pub action_store: Arc<InMemoryActionStore>,
    pub sink: Arc<MemorySink>,
    pub redis: Arc<MockRedisClient>,
    pub library: NativePluginLibrary,
    pub instance_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            plugin_store: Arc::new(InMemoryPluginStore::new()),
            person_store: Arc::new(InMemoryPersonStore::new()),
            team_store: Arc::new(InMemoryTeamStore::with_team(TEAM_ID)),
            action_store: Arc::new(InMemoryActionStore::new()),
            sink: Arc::new(MemorySink::new()),
            redis: Arc::new(MockRedisClient::new()),
            library: test_library(),
            instance_id: Uuid::now_v7(),
        }
    }

    pub fn jobs(&self) -> JobQueue {
        JobQueue::new(self.redis.clone(), "posthog-plugins")
    }

    pub fn processor(&self) -> Arc<EventProcessor> {
        let teams = Arc::new(TeamManager::new(
            self.team_store.clone(),
            Duration::from_secs(30),
        ));
        let persons = PersonResolver::new(self.person_store.clone(), self.sink.clone());
        Arc::new(EventProcessor::new(teams, persons, self.sink.clone()))
    }

    pub fn registry(&self) -> PluginRegistry {
        PluginRegistry::new(
            self.plugin_store.clone(),
            Arc::new(self.library.clone()),
            self.redis.clone(),
            self.jobs(),
            self.instance_id,
        )
    }

    pub fn worker_context(&self) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            plugin_repository: self.plugin_store.clone(),
            compiler: Arc::new(self.library.clone()),
            action_repository: self.action_store.clone(),
            processor: self.processor(),
            redis: self.redis.clone(),
            jobs: self.jobs(),
            instance_id: self.instance_id,
            ingestion_enabled: true,
        })
    }

    pub fn worker_pool(&self, workers: usize, tasks_per_worker: usize, timeout: u64) -> WorkerPool {
        WorkerPool::spawn(
            self.worker_context(),
            workers,
            tasks_per_worker,
            Duration::from_secs(timeout),
        )
    }

    pub fn add_source_plugin(&self, plugin_id: i32, name: &str) {
        self.plugin_store.add_plugin(source_plugin(plugin_id, name));
    }

    pub fn add_config(&self, config_id: i32, plugin_id: i32, order: i32) {
        self.plugin_store
            .add_config(plugin_config(config_id, plugin_id, TEAM_ID, order, json!({})));
    }

    /// The key the `counter` test plugin increments per invocation.
    pub fn invocation_key(&self, plugin_id: i32) -> String {
        format!("@plugin/{plugin_id}/{TEAM_ID}/invocations")
    }

    pub fn invocations(&self, plugin_id: i32) -> i64 {
        self.redis
            .peek(&self.invocation_key(plugin_id))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

pub fn source_plugin(plugin_id: i32, name: &str) -> Plugin {
    Plugin {
        id: plugin_id,
        name: name.to_string(),
        url: None,
        source: Some("// native runtime".to_string()),
        archive: None,
        updated_at: Utc::now(),
        capabilities: None,
    }
}

pub fn archive_plugin(plugin_id: i32, name: &str, archive: Vec<u8>) -> Plugin {
    Plugin {
        id: plugin_id,
        name: name.to_string(),
        url: None,
        source: None,
        archive: Some(archive),
        updated_at: Utc::now(),
        capabilities: None,
    }
}

pub fn plugin_config(
    config_id: i32,
    plugin_id: i32,
    team_id: i32,
    order: i32,
    config: Value,
) -> PluginConfig {
    PluginConfig {
        id: config_id,
        plugin_id,
        team_id,
        enabled: true,
        order,
        config: Json(config),
        updated_at: Utc::now(),
    }
}

pub fn event(distinct_id: &str, name: &str) -> PluginEvent {
    event_for_team(TEAM_ID, distinct_id, name, json!({}))
}

pub fn event_for_team(
    team_id: i32,
    distinct_id: &str,
    name: &str,
    properties: Value,
) -> PluginEvent {
    PluginEvent {
        uuid: Uuid::now_v7(),
        distinct_id: distinct_id.to_string(),
        team_id,
        event: name.to_string(),
        properties: serde_json::from_value(properties).unwrap(),
        ip: None,
        site_url: "https://example.com".to_string(),
        now: Utc::now().to_rfc3339(),
        sent_at: None,
        timestamp: None,
        offset: None,
    }
}

pub fn identify_event(distinct_id: &str, anon_distinct_id: &str) -> PluginEvent {
    event_for_team(
        TEAM_ID,
        distinct_id,
        "$identify",
        json!({ "$anon_distinct_id": anon_distinct_id }),
    )
}

/// The built-in library plus the plugins the suites need: an id-appending
/// counter, an event dropper, a thrower, a sleeper, and a flaky initializer.
pub fn test_library() -> NativePluginLibrary {
    default_library()
        .with_factory("append-id", Arc::new(AppendIdFactory))
        .with_factory("drop-events", Arc::new(DropEventsFactory))
        .with_factory("boom", Arc::new(BoomFactory))
        .with_factory("sleeper", Arc::new(SleeperFactory))
        .with_factory("flaky", Arc::new(FlakyFactory::new(u32::MAX)))
}

/// Appends its config id to `properties.plugins` and bumps an invocation
/// counter in the plugin cache.
pub struct AppendIdFactory;

#[async_trait]
impl PluginFactory for AppendIdFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event = Some(process_event_fn(|mut event, meta: PluginMeta| async move {
            meta.cache
                .incr("invocations", 1)
                .await
                .map_err(|e| PluginRuntimeError::new(e.to_string()))?;
            let plugins = event
                .properties
                .entry("plugins".to_string())
                .or_insert_with(|| json!([]));
            if let Some(list) = plugins.as_array_mut() {
                list.push(json!(meta.config.id));
            }
            Ok(Some(event))
        }));
        Ok(vm)
    }
}

pub struct DropEventsFactory;

#[async_trait]
impl PluginFactory for DropEventsFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event =
            Some(process_event_fn(|_event, _meta| async move { Ok(None) }));
        Ok(vm)
    }
}

pub struct BoomFactory;

#[async_trait]
impl PluginFactory for BoomFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event = Some(process_event_fn(|_event, _meta| async move {
            Err(PluginRuntimeError::new("boom"))
        }));
        Ok(vm)
    }
}

/// Sleeps `seconds` from its config on every event.
pub struct SleeperFactory;

#[async_trait]
impl PluginFactory for SleeperFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let seconds = meta
            .config
            .config
            .0
            .get("seconds")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event = Some(process_event_fn(move |event, _meta| async move {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            Ok(Some(event))
        }));
        Ok(vm)
    }
}

/// Raises the retryable setup marker until `succeed_after` attempts have
/// been made.
pub struct FlakyFactory {
    succeed_after: u32,
    attempts: AtomicU32,
}

impl FlakyFactory {
    pub fn new(succeed_after: u32) -> Self {
        Self {
            succeed_after,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginFactory for FlakyFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.succeed_after {
            return Err(PluginSetupError::Retry(format!(
                "warming up, attempt {attempt}"
            )));
        }
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event =
            Some(process_event_fn(|event, _meta| async move { Ok(Some(event)) }));
        Ok(vm)
    }
}

/// Counts instantiations; for VM-reuse assertions.
pub struct CountingFactory {
    pub instantiations: AtomicU32,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            instantiations: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PluginFactory for CountingFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        let mut vm = PluginVm::new(meta);
        vm.methods.process_event =
            Some(process_event_fn(|event, _meta| async move { Ok(Some(event)) }));
        Ok(vm)
    }
}

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn props(v: Value) -> HashMap<String, Value> {
    serde_json::from_value(v).unwrap()
}
