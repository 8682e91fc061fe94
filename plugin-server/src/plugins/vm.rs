use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics_consts::{PLUGINS_DISABLED, PLUGIN_SETUP_RETRIES};
use crate::plugins::runtime::{PluginCompiler, PluginMeta, PluginVm};
use crate::plugins::types::{
    LogEntrySource, LogEntryType, Plugin, PluginConfig, PluginErrorRecord, PluginLogEntry,
    PluginSetupError,
};
use crate::store::PluginRepository;

const SETUP_MAX_ATTEMPTS: u32 = 10;
const SETUP_BASE_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
pub enum VmResolution {
    #[default]
    Pending,
    Ready(Arc<PluginVm>),
    Failed,
}

/// The single-shot future every caller of a plugin's VM reads.
///
/// A background task drives `Pending` to `Ready` or `Failed`; readers either
/// await the resolution (scheduled tasks) or peek and skip while it is
/// pending (ingestion). `Failed` means "skip this plugin", permanently.
#[derive(Clone)]
pub struct LazyVm {
    resolution: watch::Receiver<VmResolution>,
}

impl LazyVm {
    pub fn spawn(
        plugin: Arc<Plugin>,
        config: Arc<PluginConfig>,
        compiler: Arc<dyn PluginCompiler>,
        repository: Arc<dyn PluginRepository>,
        meta: PluginMeta,
        instance_id: Uuid,
    ) -> LazyVm {
        let (tx, rx) = watch::channel(VmResolution::Pending);
        tokio::spawn(drive_setup(
            plugin,
            config,
            compiler,
            repository,
            meta,
            instance_id,
            tx,
        ));
        LazyVm { resolution: rx }
    }

    /// A handle that is already resolved; used when reusing a compiled VM
    /// across reloads and in tests.
    pub fn resolved(vm: Arc<PluginVm>) -> LazyVm {
        let (_tx, rx) = watch::channel(VmResolution::Ready(vm));
        LazyVm { resolution: rx }
    }

    pub fn peek(&self) -> VmResolution {
        self.resolution.borrow().clone()
    }

    /// Non-blocking view: the VM if it is ready right now. Pending and
    /// failed both come back `None`; ingestion treats them the same way.
    pub fn ready(&self) -> Option<Arc<PluginVm>> {
        match self.peek() {
            VmResolution::Ready(vm) => Some(vm),
            _ => None,
        }
    }

    /// Wait for the resolution. `None` means the plugin permanently failed
    /// and must be skipped.
    pub async fn resolve(&self) -> Option<Arc<PluginVm>> {
        let mut rx = self.resolution.clone();
        loop {
            match rx.borrow_and_update().clone() {
                VmResolution::Ready(vm) => return Some(vm),
                VmResolution::Failed => return None,
                VmResolution::Pending => {
                    if rx.changed().await.is_err() {
                        // Writer dropped without resolving; treat as failed
                        return None;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_setup(
    plugin: Arc<Plugin>,
    config: Arc<PluginConfig>,
    compiler: Arc<dyn PluginCompiler>,
    repository: Arc<dyn PluginRepository>,
    meta: PluginMeta,
    instance_id: Uuid,
    tx: watch::Sender<VmResolution>,
) {
    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;
        match compiler.compile(&plugin, meta.clone()).await {
            Ok(vm) => break Ok(vm),
            Err(PluginSetupError::Retry(message)) if attempt < SETUP_MAX_ATTEMPTS => {
                metrics::counter!(PLUGIN_SETUP_RETRIES).increment(1);
                let delay = SETUP_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    plugin_config_id = config.id,
                    attempt, "plugin setup asked for retry in {:?}: {}", delay, message
                );
                tokio::time::sleep(delay).await;
            }
            Err(PluginSetupError::Retry(message)) => {
                break Err(format!("setup retries exhausted: {message}"));
            }
            Err(PluginSetupError::Fatal(message)) => break Err(message),
        }
    };

    match outcome {
        Ok(vm) => {
            persist_capabilities(&plugin, &vm, repository.as_ref()).await;
            let _ = tx.send(VmResolution::Ready(Arc::new(vm)));
        }
        Err(message) => {
            metrics::counter!(PLUGINS_DISABLED).increment(1);
            warn!(
                plugin_config_id = config.id,
                plugin_id = plugin.id,
                "disabling plugin after failed setup: {}",
                message
            );

            if let Err(e) = repository
                .record_plugin_error(config.id, &PluginErrorRecord::new(&message))
                .await
            {
                warn!("failed to record plugin error: {}", e);
            }
            if let Err(e) = repository.disable_plugin_config(config.id).await {
                warn!("failed to disable plugin config {}: {}", config.id, e);
            }
            let entry = PluginLogEntry {
                team_id: config.team_id,
                plugin_id: plugin.id,
                plugin_config_id: config.id,
                source: LogEntrySource::System,
                type_: LogEntryType::Error,
                message,
                instance_id,
                timestamp: Utc::now(),
            };
            if let Err(e) = repository.append_log_entry(&entry).await {
                warn!("failed to append plugin log entry: {}", e);
            }

            let _ = tx.send(VmResolution::Failed);
        }
    }
}

async fn persist_capabilities(plugin: &Plugin, vm: &PluginVm, repository: &dyn PluginRepository) {
    let capabilities = vm.capabilities();
    let stored = plugin.capabilities.as_ref().map(|c| &c.0);
    if stored == Some(&capabilities) {
        return;
    }
    info!(
        plugin_id = plugin.id,
        "storing changed capabilities: {:?}", capabilities
    );
    if let Err(e) = repository.store_capabilities(plugin.id, &capabilities).await {
        warn!("failed to store plugin capabilities: {}", e);
    }
}
