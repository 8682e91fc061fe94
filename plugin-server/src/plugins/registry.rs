use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use common_redis::Client as RedisClientTrait;
use common_types::{PluginEvent, TeamId};

use crate::jobs::JobQueue;
use crate::metrics_consts::{PLUGIN_ERRORS, PLUGIN_EVENTS_DROPPED, PLUGIN_PROCESS_EVENT_TIME};
use crate::plugins::runtime::{PluginCache, PluginCompiler, PluginMeta, PluginStorage};
use crate::plugins::schedule::{Periodicity, PluginSchedule};
use crate::plugins::types::{
    LogEntrySource, LogEntryType, Plugin, PluginAttachment, PluginConfig, PluginConfigId,
    PluginErrorRecord, PluginLogEntry,
};
use crate::plugins::vm::LazyVm;
use crate::store::PluginRepository;

struct LoadedPlugin {
    plugin: Arc<Plugin>,
    config: Arc<PluginConfig>,
    vm: LazyVm,
}

/// One worker's view of the plugin world: the `(team -> ordered configs)`
/// map, the VM handles, and the cached schedule. Each worker owns its own
/// registry; reload tasks are broadcast so every instance converges.
pub struct PluginRegistry {
    repository: Arc<dyn PluginRepository>,
    compiler: Arc<dyn PluginCompiler>,
    redis: Arc<dyn RedisClientTrait>,
    jobs: JobQueue,
    instance_id: Uuid,
    configs: HashMap<PluginConfigId, LoadedPlugin>,
    by_team: HashMap<TeamId, Vec<PluginConfigId>>,
    schedule: Option<PluginSchedule>,
}

impl PluginRegistry {
    pub fn new(
        repository: Arc<dyn PluginRepository>,
        compiler: Arc<dyn PluginCompiler>,
        redis: Arc<dyn RedisClientTrait>,
        jobs: JobQueue,
        instance_id: Uuid,
    ) -> Self {
        Self {
            repository,
            compiler,
            redis,
            jobs,
            instance_id,
            configs: HashMap::new(),
            by_team: HashMap::new(),
            schedule: None,
        }
    }

    /// Load the three plugin tables and (re)materialize per-team pipelines.
    /// A previously compiled VM is reused iff neither the config row nor the
    /// plugin row changed underneath it; everything else recompiles lazily.
    pub async fn setup_plugins(&mut self) -> Result<(), crate::store::StoreError> {
        let plugins: HashMap<i32, Arc<Plugin>> = self
            .repository
            .fetch_plugins()
            .await?
            .into_iter()
            .map(|p| (p.id, Arc::new(p)))
            .collect();

        let mut attachments: HashMap<PluginConfigId, HashMap<String, PluginAttachment>> =
            HashMap::new();
        for attachment in self.repository.fetch_plugin_attachments().await? {
            attachments
                .entry(attachment.plugin_config_id)
                .or_default()
                .insert(attachment.key.clone(), attachment);
        }

        let mut configs = HashMap::new();
        let mut by_team: HashMap<TeamId, Vec<PluginConfigId>> = HashMap::new();

        for config in self.repository.fetch_plugin_configs().await? {
            if !config.enabled {
                continue;
            }
            let Some(plugin) = plugins.get(&config.plugin_id) else {
                warn!(
                    plugin_config_id = config.id,
                    "config references missing plugin {}", config.plugin_id
                );
                continue;
            };

            let config = Arc::new(config);
            let vm = match self.configs.get(&config.id) {
                Some(prior)
                    if prior.config.updated_at == config.updated_at
                        && prior.plugin.updated_at == plugin.updated_at =>
                {
                    prior.vm.clone()
                }
                _ => {
                    let meta = self.build_meta(
                        plugin,
                        config.clone(),
                        attachments.remove(&config.id).unwrap_or_default(),
                    );
                    LazyVm::spawn(
                        plugin.clone(),
                        config.clone(),
                        self.compiler.clone(),
                        self.repository.clone(),
                        meta,
                        self.instance_id,
                    )
                }
            };

            by_team.entry(config.team_id).or_default().push(config.id);
            configs.insert(
                config.id,
                LoadedPlugin {
                    plugin: plugin.clone(),
                    config,
                    vm,
                },
            );
        }

        // Pipeline execution order is strictly ascending (order, id)
        for ids in by_team.values_mut() {
            ids.sort_by_key(|id| {
                let config = &configs[id].config;
                (config.order, config.id)
            });
        }

        self.configs = configs;
        self.by_team = by_team;
        // Stale until the next loadSchedule; consumers wait on None
        self.schedule = None;
        Ok(())
    }

    fn build_meta(
        &self,
        plugin: &Arc<Plugin>,
        config: Arc<PluginConfig>,
        attachments: HashMap<String, PluginAttachment>,
    ) -> PluginMeta {
        PluginMeta {
            cache: PluginCache::new(self.redis.clone(), plugin.id, config.team_id),
            storage: PluginStorage::new(self.redis.clone(), config.id),
            global: Arc::new(Mutex::new(json!({}))),
            attachments: Arc::new(attachments),
            jobs: self.jobs.clone(),
            config,
        }
    }

    /// Run the team's pipeline over one event. Returns `None` when a plugin
    /// dropped the event; nothing downstream must see it in that case.
    pub async fn run_process_event(&self, mut event: PluginEvent) -> Option<PluginEvent> {
        let Some(ids) = self.by_team.get(&event.team_id) else {
            return Some(event);
        };

        for id in ids {
            let loaded = &self.configs[id];
            // Ingestion never blocks on a pending VM, it just skips the config
            let Some(vm) = loaded.vm.ready() else {
                continue;
            };
            let Some(process_event) = vm.methods.process_event.clone() else {
                continue;
            };

            let timer = common_metrics::timing_guard(PLUGIN_PROCESS_EVENT_TIME, &[]);
            match process_event(event.clone(), vm.meta.clone()).await {
                Ok(Some(processed)) => {
                    event = processed;
                    timer.label("outcome", "success").fin();
                }
                Ok(None) => {
                    timer.label("outcome", "dropped").fin();
                    metrics::counter!(PLUGIN_EVENTS_DROPPED).increment(1);
                    return None;
                }
                Err(error) => {
                    timer.label("outcome", "error").fin();
                    self.record_runtime_error(loaded, &error.message, Some(event.uuid))
                        .await;
                    // The unchanged event continues into the next config
                }
            }
        }

        Some(event)
    }

    /// Batch variant; configs exposing `processEventBatch` get the whole
    /// batch at once, everything else falls back to per-event processing.
    pub async fn run_process_event_batch(&self, events: Vec<PluginEvent>) -> Vec<PluginEvent> {
        let mut by_team: HashMap<TeamId, Vec<PluginEvent>> = HashMap::new();
        for event in events {
            by_team.entry(event.team_id).or_default().push(event);
        }

        let mut out = Vec::new();
        for (team_id, mut batch) in by_team {
            let Some(ids) = self.by_team.get(&team_id) else {
                out.extend(batch);
                continue;
            };

            for id in ids {
                let loaded = &self.configs[id];
                let Some(vm) = loaded.vm.ready() else {
                    continue;
                };

                if let Some(process_batch) = vm.methods.process_event_batch.clone() {
                    match process_batch(batch.clone(), vm.meta.clone()).await {
                        Ok(processed) => batch = processed,
                        Err(error) => {
                            self.record_runtime_error(loaded, &error.message, None).await;
                        }
                    }
                } else if let Some(process_event) = vm.methods.process_event.clone() {
                    let mut next = Vec::with_capacity(batch.len());
                    for event in batch {
                        let uuid = event.uuid;
                        match process_event(event.clone(), vm.meta.clone()).await {
                            Ok(Some(processed)) => next.push(processed),
                            Ok(None) => {
                                metrics::counter!(PLUGIN_EVENTS_DROPPED).increment(1);
                            }
                            Err(error) => {
                                self.record_runtime_error(loaded, &error.message, Some(uuid))
                                    .await;
                                next.push(event);
                            }
                        }
                    }
                    batch = next;
                }
            }
            out.extend(batch);
        }
        out
    }

    /// Post-ingestion fanout. Only events that survived the pipeline are
    /// handed to `onEvent`/`onSnapshot` handlers.
    pub async fn run_on_event(&self, event: &PluginEvent) {
        let Some(ids) = self.by_team.get(&event.team_id) else {
            return;
        };
        for id in ids {
            let loaded = &self.configs[id];
            let Some(vm) = loaded.vm.ready() else {
                continue;
            };
            let hook = if event.is_snapshot() {
                vm.methods.on_snapshot.clone()
            } else {
                vm.methods.on_event.clone()
            };
            if let Some(hook) = hook {
                if let Err(error) = hook(event.clone(), vm.meta.clone()).await {
                    self.record_runtime_error(loaded, &error.message, Some(event.uuid))
                        .await;
                }
            }

            if let Some(export) = vm.methods.export_events.clone() {
                if let Err(error) = export(vec![event.clone()], vm.meta.clone()).await {
                    self.record_runtime_error(loaded, &error.message, Some(event.uuid))
                        .await;
                }
            }
        }
    }

    /// Invoke one config's scheduled task. Scheduled work can afford to wait
    /// for a pending VM, so this resolves rather than peeks.
    pub async fn run_plugin_task(&self, config_id: PluginConfigId, task_name: &str) {
        let Some(loaded) = self.configs.get(&config_id) else {
            warn!(config_id, "scheduled task for unknown plugin config");
            return;
        };
        let Some(vm) = loaded.vm.resolve().await else {
            return;
        };
        let Some(task) = vm.tasks.get(task_name).cloned() else {
            return;
        };
        if let Err(error) = task(vm.meta.clone()).await {
            self.record_runtime_error(loaded, &error.message, None).await;
        }
    }

    /// Rebuild the periodicity buckets by inspecting every VM's task map.
    /// Waits for pending VMs; plugins that permanently failed just don't
    /// appear.
    pub async fn load_schedule(&mut self) -> &PluginSchedule {
        let mut schedule = PluginSchedule::default();

        let mut ids: Vec<PluginConfigId> = self.configs.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(vm) = self.configs[&id].vm.resolve().await else {
                continue;
            };
            for periodicity in Periodicity::ALL {
                if vm.tasks.contains_key(periodicity.task_name()) {
                    schedule.bucket_mut(periodicity).push(id);
                }
            }
        }

        self.schedule.insert(schedule)
    }

    /// The cached schedule; `None` until `load_schedule` has completed since
    /// the last reload.
    pub fn schedule(&self) -> Option<PluginSchedule> {
        self.schedule.clone()
    }

    /// Run every live VM's teardown hook; used on reload and shutdown.
    pub async fn teardown_plugins(&self) {
        for loaded in self.configs.values() {
            let Some(vm) = loaded.vm.ready() else {
                continue;
            };
            let Some(teardown) = vm.methods.teardown_plugin.clone() else {
                continue;
            };
            if let Err(error) = teardown(vm.meta.clone()).await {
                self.record_runtime_error(loaded, &error.message, None).await;
            }
        }
    }

    /// Pipeline order for one team, exposed for tests and the schedule.
    pub fn team_pipeline(&self, team_id: TeamId) -> Vec<PluginConfigId> {
        self.by_team.get(&team_id).cloned().unwrap_or_default()
    }

    async fn record_runtime_error(
        &self,
        loaded: &LoadedPlugin,
        message: &str,
        event_uuid: Option<Uuid>,
    ) {
        metrics::counter!(PLUGIN_ERRORS).increment(1);
        let record = match event_uuid {
            Some(uuid) => PluginErrorRecord::for_event(message, uuid),
            None => PluginErrorRecord::new(message),
        };
        if let Err(e) = self
            .repository
            .record_plugin_error(loaded.config.id, &record)
            .await
        {
            warn!("failed to record plugin error: {}", e);
        }
        let entry = PluginLogEntry {
            team_id: loaded.config.team_id,
            plugin_id: loaded.plugin.id,
            plugin_config_id: loaded.config.id,
            source: LogEntrySource::Plugin,
            type_: LogEntryType::Error,
            message: message.to_string(),
            instance_id: self.instance_id,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.repository.append_log_entry(&entry).await {
            warn!("failed to append plugin log entry: {}", e);
        }
    }
}
