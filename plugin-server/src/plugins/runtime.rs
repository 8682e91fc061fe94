use std::collections::HashMap;
use std::future::Future;
use std::io::{Cursor, Read};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use common_redis::{Client as RedisClientTrait, CustomRedisError};
use common_types::PluginEvent;

use crate::jobs::JobQueue;
use crate::plugins::types::{
    Plugin, PluginAttachment, PluginCapabilities, PluginConfig, PluginRuntimeError,
    PluginSetupError,
};

pub type MethodFuture<T> = Pin<Box<dyn Future<Output = Result<T, PluginRuntimeError>> + Send>>;

pub type ProcessEventFn =
    Arc<dyn Fn(PluginEvent, PluginMeta) -> MethodFuture<Option<PluginEvent>> + Send + Sync>;
pub type ProcessEventBatchFn =
    Arc<dyn Fn(Vec<PluginEvent>, PluginMeta) -> MethodFuture<Vec<PluginEvent>> + Send + Sync>;
pub type EventHookFn = Arc<dyn Fn(PluginEvent, PluginMeta) -> MethodFuture<()> + Send + Sync>;
pub type ExportEventsFn =
    Arc<dyn Fn(Vec<PluginEvent>, PluginMeta) -> MethodFuture<()> + Send + Sync>;
pub type LifecycleFn = Arc<dyn Fn(PluginMeta) -> MethodFuture<()> + Send + Sync>;
pub type JobFn = Arc<dyn Fn(Value, PluginMeta) -> MethodFuture<()> + Send + Sync>;

/// Box an async closure into a pipeline method.
pub fn process_event_fn<F, Fut>(f: F) -> ProcessEventFn
where
    F: Fn(PluginEvent, PluginMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<PluginEvent>, PluginRuntimeError>> + Send + 'static,
{
    Arc::new(move |event, meta| Box::pin(f(event, meta)))
}

pub fn process_event_batch_fn<F, Fut>(f: F) -> ProcessEventBatchFn
where
    F: Fn(Vec<PluginEvent>, PluginMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<PluginEvent>, PluginRuntimeError>> + Send + 'static,
{
    Arc::new(move |events, meta| Box::pin(f(events, meta)))
}

pub fn event_hook_fn<F, Fut>(f: F) -> EventHookFn
where
    F: Fn(PluginEvent, PluginMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginRuntimeError>> + Send + 'static,
{
    Arc::new(move |event, meta| Box::pin(f(event, meta)))
}

pub fn lifecycle_fn<F, Fut>(f: F) -> LifecycleFn
where
    F: Fn(PluginMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginRuntimeError>> + Send + 'static,
{
    Arc::new(move |meta| Box::pin(f(meta)))
}

pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn(Value, PluginMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginRuntimeError>> + Send + 'static,
{
    Arc::new(move |payload, meta| Box::pin(f(payload, meta)))
}

/// The tagged record of optional plugin entry points. Dispatch is on
/// presence: a VM that exposes no `process_event` simply doesn't participate
/// in the pipeline.
#[derive(Clone, Default)]
pub struct PluginMethods {
    pub process_event: Option<ProcessEventFn>,
    pub process_event_batch: Option<ProcessEventBatchFn>,
    pub on_event: Option<EventHookFn>,
    pub on_snapshot: Option<EventHookFn>,
    pub export_events: Option<ExportEventsFn>,
    pub teardown_plugin: Option<LifecycleFn>,
}

/// Everything a plugin invocation gets handed alongside the event. Cheap to
/// clone; the mutable pieces are shared behind their own locks.
#[derive(Clone)]
pub struct PluginMeta {
    pub config: Arc<PluginConfig>,
    pub attachments: Arc<HashMap<String, PluginAttachment>>,
    /// Per-VM scratch state, confined to one worker's VM instance
    pub global: Arc<Mutex<Value>>,
    /// Redis-backed K/V shared by every instance of this plugin
    pub cache: PluginCache,
    /// Redis-backed K/V scoped to this one config
    pub storage: PluginStorage,
    /// Dispatch plugin jobs onto the legacy queue
    pub jobs: JobQueue,
}

#[derive(Clone)]
pub struct PluginCache {
    redis: Arc<dyn RedisClientTrait>,
    prefix: String,
}

impl PluginCache {
    pub fn new(redis: Arc<dyn RedisClientTrait>, plugin_id: i32, team_id: i32) -> Self {
        Self {
            redis,
            prefix: format!("@plugin/{plugin_id}/{team_id}"),
        }
    }

    fn key(&self, k: &str) -> String {
        format!("{}/{}", self.prefix, k)
    }

    pub async fn get(&self, k: &str) -> Result<Option<Value>, CustomRedisError> {
        match self.redis.get(self.key(k)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set(
        &self,
        k: &str,
        v: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        let serialized = v.to_string();
        match ttl_seconds {
            Some(ttl) => self.redis.setex(self.key(k), serialized, ttl).await,
            None => self.redis.set(self.key(k), serialized).await,
        }
    }

    pub async fn incr(&self, k: &str, by: i64) -> Result<i64, CustomRedisError> {
        self.redis.incr(self.key(k), by).await
    }
}

#[derive(Clone)]
pub struct PluginStorage {
    cache: PluginCache,
}

impl PluginStorage {
    pub fn new(redis: Arc<dyn RedisClientTrait>, plugin_config_id: i32) -> Self {
        Self {
            cache: PluginCache {
                redis,
                prefix: format!("@plugin_storage/{plugin_config_id}"),
            },
        }
    }

    pub async fn get(&self, k: &str) -> Result<Option<Value>, CustomRedisError> {
        self.cache.get(k).await
    }

    pub async fn set(&self, k: &str, v: &Value) -> Result<(), CustomRedisError> {
        self.cache.set(k, v, None).await
    }

    pub async fn del(&self, k: &str) -> Result<(), CustomRedisError> {
        self.cache.redis.del(self.cache.key(k)).await
    }
}

/// A materialized plugin runtime for one config. Holds the method record,
/// the scheduled task map and the job map; capability extraction just
/// enumerates what is present.
pub struct PluginVm {
    pub methods: PluginMethods,
    pub tasks: HashMap<String, LifecycleFn>,
    pub jobs: HashMap<String, JobFn>,
    pub meta: PluginMeta,
}

pub const SCHEDULED_TASK_NAMES: [&str; 3] = ["runEveryMinute", "runEveryHour", "runEveryDay"];

impl PluginVm {
    pub fn new(meta: PluginMeta) -> Self {
        Self {
            methods: PluginMethods::default(),
            tasks: HashMap::new(),
            jobs: HashMap::new(),
            meta,
        }
    }

    pub fn capabilities(&self) -> PluginCapabilities {
        let mut methods = Vec::new();
        if self.methods.process_event.is_some() {
            methods.push("processEvent".to_string());
        }
        if self.methods.process_event_batch.is_some() {
            methods.push("processEventBatch".to_string());
        }
        if self.methods.on_event.is_some() {
            methods.push("onEvent".to_string());
        }
        if self.methods.on_snapshot.is_some() {
            methods.push("onSnapshot".to_string());
        }
        if self.methods.export_events.is_some() {
            methods.push("exportEvents".to_string());
        }
        if self.methods.teardown_plugin.is_some() {
            methods.push("teardownPlugin".to_string());
        }

        let mut scheduled_tasks: Vec<String> = SCHEDULED_TASK_NAMES
            .iter()
            .filter(|name| self.tasks.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        scheduled_tasks.sort();

        let mut jobs: Vec<String> = self.jobs.keys().cloned().collect();
        jobs.sort();

        PluginCapabilities {
            methods,
            scheduled_tasks,
            jobs,
        }
    }
}

/// A validated plugin source unit: the manifest plus the main source text,
/// extracted from the archive / inline source.
#[derive(Debug, Clone)]
pub struct PluginModule {
    pub name: String,
    pub main_source: String,
}

#[derive(Debug, Default, Deserialize)]
struct PluginManifest {
    name: Option<String>,
    main: Option<String>,
}

impl PluginModule {
    /// Validate and unpack a plugin row into a module. Corrupt archives and
    /// missing manifests are permanent failures: the plugin can never come
    /// up until its row changes.
    pub fn parse(plugin: &Plugin) -> Result<PluginModule, PluginSetupError> {
        if let Some(archive) = &plugin.archive {
            return Self::parse_archive(plugin, archive);
        }

        if let Some(source) = &plugin.source {
            return Ok(PluginModule {
                name: plugin.name.clone(),
                main_source: source.clone(),
            });
        }

        // Archive download happens upstream of this service; a url-only row
        // reaching us means that step never ran.
        Err(PluginSetupError::Fatal(format!(
            "plugin {} has no archive or source",
            plugin.id
        )))
    }

    fn parse_archive(plugin: &Plugin, archive: &[u8]) -> Result<PluginModule, PluginSetupError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive))
            .map_err(|e| PluginSetupError::Fatal(format!("not a valid zip archive: {e}")))?;

        let manifest_raw = read_zip_entry(&mut zip, "plugin.json")?
            .ok_or_else(|| PluginSetupError::Fatal("archive is missing plugin.json".to_string()))?;
        let manifest: PluginManifest = serde_json::from_str(&manifest_raw)
            .map_err(|e| PluginSetupError::Fatal(format!("invalid plugin.json: {e}")))?;

        let main = manifest.main.unwrap_or_else(|| "index.js".to_string());
        let main_source = read_zip_entry(&mut zip, &main)?.ok_or_else(|| {
            PluginSetupError::Fatal(format!("archive is missing main file {main}"))
        })?;

        Ok(PluginModule {
            name: manifest.name.unwrap_or_else(|| plugin.name.clone()),
            main_source,
        })
    }
}

/// Find `name` at the archive root, tolerating the single wrapping directory
/// GitHub-style archives carry.
fn read_zip_entry(
    zip: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, PluginSetupError> {
    let candidates: Vec<String> = zip
        .file_names()
        .filter(|entry| {
            *entry == name
                || (entry.ends_with(name) && entry.matches('/').count() == 1)
        })
        .map(|s| s.to_string())
        .collect();

    let Some(path) = candidates.into_iter().min_by_key(|p| p.len()) else {
        return Ok(None);
    };

    let mut contents = String::new();
    zip.by_name(&path)
        .map_err(|e| PluginSetupError::Fatal(format!("unreadable archive entry {path}: {e}")))?
        .read_to_string(&mut contents)
        .map_err(|e| PluginSetupError::Fatal(format!("archive entry {path} is not UTF-8: {e}")))?;
    Ok(Some(contents))
}

/// Turns a plugin row into a runnable VM for one config.
///
/// The source-to-callable step is a separate compiler pass that runs outside
/// this service; what's registered here are the runtimes it produced, keyed
/// by module name. Compilation in this process is validation plus lookup.
#[async_trait]
pub trait PluginCompiler: Send + Sync {
    async fn compile(
        &self,
        plugin: &Plugin,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError>;
}

#[async_trait]
pub trait PluginFactory: Send + Sync {
    async fn instantiate(
        &self,
        module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError>;
}

#[derive(Clone, Default)]
pub struct NativePluginLibrary {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl NativePluginLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(
        mut self,
        name: impl Into<String>,
        factory: Arc<dyn PluginFactory>,
    ) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }
}

#[async_trait]
impl PluginCompiler for NativePluginLibrary {
    async fn compile(
        &self,
        plugin: &Plugin,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let module = PluginModule::parse(plugin)?;
        let factory = self.factories.get(&module.name).ok_or_else(|| {
            PluginSetupError::Fatal(format!("no runtime registered for plugin {}", module.name))
        })?;
        factory.instantiate(&module, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn plugin_with_archive(archive: Vec<u8>) -> Plugin {
        Plugin {
            id: 60,
            name: "test-plugin".to_string(),
            url: None,
            source: None,
            archive: Some(archive),
            updated_at: Utc::now(),
            capabilities: None,
        }
    }

    fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut buf = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut buf);
        for (name, contents) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        buf.into_inner()
    }

    #[test]
    fn parses_archive_with_manifest() {
        let archive = zip_archive(&[
            ("plugin.json", r#"{"name": "my-plugin", "main": "index.js"}"#),
            ("index.js", "function processEvent(event) { return event }"),
        ]);
        let module = PluginModule::parse(&plugin_with_archive(archive)).unwrap();
        assert_eq!(module.name, "my-plugin");
        assert!(module.main_source.contains("processEvent"));
    }

    #[test]
    fn parses_archive_with_wrapping_directory() {
        let archive = zip_archive(&[
            ("my-plugin-main/plugin.json", r#"{"name": "my-plugin"}"#),
            ("my-plugin-main/index.js", "// plugin"),
        ]);
        let module = PluginModule::parse(&plugin_with_archive(archive)).unwrap();
        assert_eq!(module.name, "my-plugin");
    }

    #[test]
    fn broken_archive_is_a_permanent_failure() {
        let err =
            PluginModule::parse(&plugin_with_archive(b"this is not a zip".to_vec())).unwrap_err();
        assert!(matches!(err, PluginSetupError::Fatal(_)));
    }

    #[test]
    fn missing_manifest_is_a_permanent_failure() {
        let archive = zip_archive(&[("index.js", "// plugin")]);
        let err = PluginModule::parse(&plugin_with_archive(archive)).unwrap_err();
        let PluginSetupError::Fatal(message) = err else {
            panic!("expected fatal error");
        };
        assert!(message.contains("plugin.json"));
    }

    #[test]
    fn inline_source_plugins_skip_the_archive() {
        let plugin = Plugin {
            archive: None,
            source: Some("function processEvent(e) { return e }".to_string()),
            ..plugin_with_archive(vec![])
        };
        let module = PluginModule::parse(&plugin).unwrap();
        assert_eq!(module.name, "test-plugin");
    }
}
