mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use plugin_server::plugins::runtime::NativePluginLibrary;
use plugin_server::plugins::vm::{LazyVm, VmResolution};
use plugin_server::plugins::PluginRegistry;

async fn ready_registry(harness: &Harness) -> PluginRegistry {
    let mut registry = harness.registry();
    registry.setup_plugins().await.unwrap();
    // Waits for every VM to resolve, so tests observe steady state
    registry.load_schedule().await;
    registry
}

#[tokio::test]
async fn pipeline_runs_in_order_id_order() {
    let harness = Harness::new();
    // Three configs with orders {2, 1, 3}; ids deliberately shuffled too
    for (plugin_id, config_id, order) in [(11, 101, 2), (12, 102, 1), (13, 103, 3)] {
        harness.add_source_plugin(plugin_id, "append-id");
        harness.add_config(config_id, plugin_id, order);
    }
    let registry = ready_registry(&harness).await;

    assert_eq!(registry.team_pipeline(TEAM_ID), vec![102, 101, 103]);

    for _ in 0..2 {
        let processed = registry
            .run_process_event(event("user-1", "$pageview"))
            .await
            .expect("event survives the pipeline");
        assert_eq!(processed.properties["plugins"], json!([102, 101, 103]));
    }
}

#[tokio::test]
async fn order_ties_break_by_config_id() {
    let harness = Harness::new();
    harness.add_source_plugin(11, "append-id");
    harness.add_config(202, 11, 1);
    harness.add_config(201, 11, 1);
    let registry = ready_registry(&harness).await;

    assert_eq!(registry.team_pipeline(TEAM_ID), vec![201, 202]);
}

#[tokio::test]
async fn null_return_short_circuits_the_pipeline() {
    let harness = Harness::new();
    harness.add_source_plugin(11, "drop-events");
    harness.add_config(101, 11, 1);
    harness.add_source_plugin(12, "append-id");
    harness.add_config(102, 12, 2);
    let registry = ready_registry(&harness).await;

    let result = registry.run_process_event(event("user-1", "$pageview")).await;
    assert!(result.is_none());
    // The later plugin never ran
    assert_eq!(harness.invocations(12), 0);
}

#[tokio::test]
async fn plugin_error_passes_the_event_through_unchanged() {
    let harness = Harness::new();
    harness.add_source_plugin(11, "boom");
    harness.add_config(101, 11, 1);
    harness.add_source_plugin(12, "append-id");
    harness.add_config(102, 12, 2);
    let registry = ready_registry(&harness).await;

    let processed = registry
        .run_process_event(event("user-1", "$pageview"))
        .await
        .expect("error does not drop the event");

    // The next plugin saw the unchanged event
    assert_eq!(processed.properties["plugins"], json!([102]));
    // And the error was recorded against the offending config
    let error = harness.plugin_store.error_for(101).expect("error recorded");
    assert_eq!(error.message, "boom");
    assert!(!harness.plugin_store.is_disabled(101));
}

#[tokio::test]
async fn broken_archive_permanently_fails_and_passes_events_through() {
    let harness = Harness::new();
    harness
        .plugin_store
        .add_plugin(archive_plugin(11, "whatever", b"this is not a zip".to_vec()));
    harness.add_config(101, 11, 1);
    let registry = ready_registry(&harness).await;

    // The handle resolved null and the config was disabled with an error
    assert!(harness.plugin_store.is_disabled(101));
    let error = harness.plugin_store.error_for(101).expect("error recorded");
    assert!(error.message.contains("zip"));
    assert_eq!(harness.plugin_store.log_entries().len(), 1);

    let original = event("user-1", "$pageview");
    let processed = registry.run_process_event(original.clone()).await.unwrap();
    assert_eq!(processed, original);
}

#[tokio::test(start_paused = true)]
async fn retryable_setup_backs_off_then_succeeds() {
    let mut harness = Harness::new();
    let flaky = Arc::new(FlakyFactory::new(3));
    harness.library = NativePluginLibrary::new().with_factory("flaky", flaky.clone());

    harness.add_source_plugin(11, "flaky");
    harness.add_config(101, 11, 1);
    let registry = ready_registry(&harness).await;

    assert_eq!(flaky.attempts(), 3);
    assert!(!harness.plugin_store.is_disabled(101));

    let processed = registry.run_process_event(event("user-1", "e")).await;
    assert!(processed.is_some());

    // Capabilities were persisted once the VM came up
    let capabilities = harness.plugin_store.capabilities_of(11).unwrap();
    assert_eq!(capabilities.methods, vec!["processEvent"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_disable_the_plugin() {
    let mut harness = Harness::new();
    let flaky = Arc::new(FlakyFactory::new(u32::MAX));
    harness.library = NativePluginLibrary::new().with_factory("flaky", flaky.clone());

    harness.add_source_plugin(11, "flaky");
    harness.add_config(101, 11, 1);
    let _registry = ready_registry(&harness).await;

    assert_eq!(flaky.attempts(), 10);
    assert!(harness.plugin_store.is_disabled(101));
    let error = harness.plugin_store.error_for(101).unwrap();
    assert!(error.message.contains("retries exhausted"));
}

#[tokio::test]
async fn vms_are_reused_when_rows_are_unchanged() {
    let mut harness = Harness::new();
    let counting = Arc::new(CountingFactory::new());
    harness.library = NativePluginLibrary::new().with_factory("counted", counting.clone());

    let plugin = source_plugin(11, "counted");
    harness.plugin_store.add_plugin(plugin.clone());
    harness.add_config(101, 11, 1);

    let mut registry = harness.registry();
    registry.setup_plugins().await.unwrap();
    registry.load_schedule().await;
    assert_eq!(
        counting
            .instantiations
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // Reload without touching updated_at: the compiled VM is kept
    registry.setup_plugins().await.unwrap();
    registry.load_schedule().await;
    assert_eq!(
        counting
            .instantiations
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn schedule_is_null_until_loaded() {
    let harness = Harness::new();
    harness.add_source_plugin(11, "heartbeat");
    harness.add_config(101, 11, 1);

    let mut registry = harness.registry();
    registry.setup_plugins().await.unwrap();
    assert!(registry.schedule().is_none());

    registry.load_schedule().await;
    let schedule = registry.schedule().unwrap();
    assert_eq!(schedule.run_every_minute, vec![101]);
    assert!(schedule.run_every_hour.is_empty());
}

#[tokio::test]
async fn unknown_runtime_is_a_permanent_failure() {
    let harness = Harness::new();
    harness.add_source_plugin(11, "no-such-runtime");
    harness.add_config(101, 11, 1);
    let _registry = ready_registry(&harness).await;

    assert!(harness.plugin_store.is_disabled(101));
}

#[tokio::test]
async fn resolved_handles_are_immediately_ready() {
    use plugin_server::plugins::runtime::{PluginCache, PluginStorage};
    use plugin_server::plugins::{PluginMeta, PluginVm};
    use std::collections::HashMap;

    let harness = Harness::new();
    let meta = PluginMeta {
        config: Arc::new(plugin_config(1, 1, TEAM_ID, 0, json!({}))),
        attachments: Arc::new(HashMap::new()),
        global: Arc::new(tokio::sync::Mutex::new(json!({}))),
        cache: PluginCache::new(harness.redis.clone(), 1, TEAM_ID),
        storage: PluginStorage::new(harness.redis.clone(), 1),
        jobs: harness.jobs(),
    };

    // The reuse path hands out pre-resolved handles; they never block
    let vm = LazyVm::resolved(Arc::new(PluginVm::new(meta)));
    assert!(matches!(vm.peek(), VmResolution::Ready(_)));
    assert!(vm.ready().is_some());
    assert!(vm.resolve().await.is_some());
}
