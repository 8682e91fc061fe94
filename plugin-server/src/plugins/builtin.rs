use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::plugins::runtime::{
    lifecycle_fn, process_event_fn, NativePluginLibrary, PluginFactory, PluginMeta, PluginModule,
    PluginVm,
};
use crate::plugins::types::PluginSetupError;

/// The first-party runtimes shipped with the server. User-installed plugins
/// resolve to one of these by module name after archive validation.
pub fn default_library() -> NativePluginLibrary {
    NativePluginLibrary::new()
        .with_factory("property-filter", Arc::new(PropertyFilterFactory))
        .with_factory("downsampling", Arc::new(DownsamplingFactory))
        .with_factory("heartbeat", Arc::new(HeartbeatFactory))
}

/// Strips configured properties off every event before it is stored.
struct PropertyFilterFactory;

#[async_trait]
impl PluginFactory for PropertyFilterFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let filtered: Vec<String> = meta
            .config
            .config
            .0
            .get("properties")
            .and_then(Value::as_str)
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if filtered.is_empty() {
            return Err(PluginSetupError::Fatal(
                "property-filter requires a `properties` config entry".to_string(),
            ));
        }

        let mut vm = PluginVm::new(meta);
        vm.methods.process_event = Some(process_event_fn(move |mut event, _meta| {
            let filtered = filtered.clone();
            async move {
                for property in &filtered {
                    event.properties.remove(property);
                }
                Ok(Some(event))
            }
        }));
        Ok(vm)
    }
}

/// Forwards a configured percentage of events, drops the rest.
struct DownsamplingFactory;

#[async_trait]
impl PluginFactory for DownsamplingFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let percentage = meta
            .config
            .config
            .0
            .get("percentage")
            .and_then(Value::as_f64)
            .unwrap_or(100.0);
        if !(0.0..=100.0).contains(&percentage) {
            return Err(PluginSetupError::Fatal(format!(
                "downsampling percentage {percentage} is out of range"
            )));
        }

        let mut vm = PluginVm::new(meta);
        vm.methods.process_event = Some(process_event_fn(move |event, _meta| async move {
            let roll = rand::thread_rng().gen_range(0.0..100.0);
            Ok((roll < percentage).then_some(event))
        }));
        Ok(vm)
    }
}

/// Bumps a cache counter every minute; the canonical scheduled-task smoke
/// test in production.
struct HeartbeatFactory;

#[async_trait]
impl PluginFactory for HeartbeatFactory {
    async fn instantiate(
        &self,
        _module: &PluginModule,
        meta: PluginMeta,
    ) -> Result<PluginVm, PluginSetupError> {
        let mut vm = PluginVm::new(meta);
        vm.tasks.insert(
            "runEveryMinute".to_string(),
            lifecycle_fn(|meta: PluginMeta| async move {
                meta.cache
                    .incr("heartbeat", 1)
                    .await
                    .map_err(|e| crate::plugins::types::PluginRuntimeError::new(e.to_string()))?;
                Ok(())
            }),
        );
        Ok(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobQueue;
    use crate::plugins::runtime::{PluginCache, PluginStorage};
    use crate::plugins::types::PluginConfig;
    use chrono::Utc;
    use common_redis::MockRedisClient;
    use common_types::PluginEvent;
    use serde_json::json;
    use sqlx::types::Json;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn meta_with_config(config: Value) -> PluginMeta {
        let redis = Arc::new(MockRedisClient::new());
        PluginMeta {
            config: Arc::new(PluginConfig {
                id: 39,
                plugin_id: 60,
                team_id: 2,
                enabled: true,
                order: 0,
                config: Json(config),
                updated_at: Utc::now(),
            }),
            attachments: Arc::new(HashMap::new()),
            global: Arc::new(Mutex::new(json!({}))),
            cache: PluginCache::new(redis.clone(), 60, 2),
            storage: PluginStorage::new(redis.clone(), 39),
            jobs: JobQueue::new(redis, "posthog-plugins"),
        }
    }

    fn module() -> PluginModule {
        PluginModule {
            name: "property-filter".to_string(),
            main_source: "// native".to_string(),
        }
    }

    fn event(properties: Value) -> PluginEvent {
        PluginEvent {
            uuid: Uuid::now_v7(),
            distinct_id: "user".to_string(),
            team_id: 2,
            event: "$pageview".to_string(),
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
    async fn property_filter_strips_configured_keys() {
        let meta = meta_with_config(json!({"properties": "$ip, email"}));
        let vm = PropertyFilterFactory
            .instantiate(&module(), meta.clone())
            .await
            .unwrap();

        let process = vm.methods.process_event.clone().unwrap();
        let result = process(
            event(json!({"$ip": "127.0.0.1", "email": "a@b.c", "kept": 1})),
            meta,
        )
        .await
        .unwrap()
        .unwrap();

        assert!(!result.properties.contains_key("$ip"));
        assert!(!result.properties.contains_key("email"));
        assert!(result.properties.contains_key("kept"));
    }

    #[tokio::test]
    async fn property_filter_without_config_is_fatal() {
        let meta = meta_with_config(json!({}));
        let err = PropertyFilterFactory
            .instantiate(&module(), meta)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginSetupError::Fatal(_)));
    }

    #[tokio::test]
    async fn downsampling_at_zero_drops_everything() {
        let meta = meta_with_config(json!({"percentage": 0}));
        let vm = DownsamplingFactory
            .instantiate(&module(), meta.clone())
            .await
            .unwrap();
        let process = vm.methods.process_event.clone().unwrap();
        for _ in 0..10 {
            assert!(process(event(json!({})), meta.clone())
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn heartbeat_exposes_a_minute_task() {
        let meta = meta_with_config(json!({}));
        let vm = HeartbeatFactory.instantiate(&module(), meta).await.unwrap();
        let capabilities = vm.capabilities();
        assert!(capabilities.methods.is_empty());
        assert_eq!(capabilities.scheduled_tasks, vec!["runEveryMinute"]);
    }
}
