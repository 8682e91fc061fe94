use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{error, info};
use uuid::Uuid;

use common_redis::Client as RedisClientTrait;
use common_types::PluginEvent;

use crate::actions::{ActionId, ActionManager};
use crate::ingestion::EventProcessor;
use crate::jobs::JobQueue;
use crate::metrics_consts::{
    TASKS_COMPLETED, TASKS_FAILED, TASKS_TIMED_OUT, TASK_EXECUTION_TIME,
};
use crate::plugins::runtime::PluginCompiler;
use crate::plugins::types::PluginConfigId;
use crate::plugins::{PluginRegistry, PluginSchedule};
use crate::store::{ActionRepository, PluginRepository};

/// Everything a worker accepts. Control-plane tasks (`Reload*`, `Teardown*`,
/// `Flush*`) are broadcast so every worker's host converges; data-plane
/// tasks go to whichever worker has the shortest queue.
#[derive(Debug, Clone)]
pub enum WorkerTask {
    ProcessEvent(PluginEvent),
    ProcessEventBatch(Vec<PluginEvent>),
    IngestEvent(PluginEvent),
    MatchActions(PluginEvent),
    RunEveryMinute(PluginConfigId),
    RunEveryHour(PluginConfigId),
    RunEveryDay(PluginConfigId),
    GetPluginSchedule,
    ReloadPlugins,
    ReloadSchedule,
    ReloadAction(ActionId),
    ReloadAllActions,
    DropAction(ActionId),
    TeardownPlugins,
    FlushQueuedWrites,
}

impl WorkerTask {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerTask::ProcessEvent(_) => "processEvent",
            WorkerTask::ProcessEventBatch(_) => "processEventBatch",
            WorkerTask::IngestEvent(_) => "ingestEvent",
            WorkerTask::MatchActions(_) => "matchActions",
            WorkerTask::RunEveryMinute(_) => "runEveryMinute",
            WorkerTask::RunEveryHour(_) => "runEveryHour",
            WorkerTask::RunEveryDay(_) => "runEveryDay",
            WorkerTask::GetPluginSchedule => "getPluginSchedule",
            WorkerTask::ReloadPlugins => "reloadPlugins",
            WorkerTask::ReloadSchedule => "reloadSchedule",
            WorkerTask::ReloadAction(_) => "reloadAction",
            WorkerTask::ReloadAllActions => "reloadAllActions",
            WorkerTask::DropAction(_) => "dropAction",
            WorkerTask::TeardownPlugins => "teardownPlugins",
            WorkerTask::FlushQueuedWrites => "flushQueuedWrites",
        }
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Event(Option<PluginEvent>),
    Events(Vec<PluginEvent>),
    Ingested { published: bool },
    Actions(Vec<ActionId>),
    Schedule(Option<PluginSchedule>),
    Done,
}

/// Workers never unwind into the consumer; failure is a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

pub type TaskResult = Result<TaskOutcome, TaskError>;

/// Construction material shared by every worker's host. The pools and the
/// producer inside are thread-safe; the plugin and action state built from
/// them is per-worker.
pub struct WorkerContext {
    pub plugin_repository: Arc<dyn PluginRepository>,
    pub compiler: Arc<dyn PluginCompiler>,
    pub action_repository: Arc<dyn ActionRepository>,
    pub processor: Arc<EventProcessor>,
    pub redis: Arc<dyn RedisClientTrait>,
    pub jobs: JobQueue,
    pub instance_id: Uuid,
    pub ingestion_enabled: bool,
}

/// One worker's isolated execution context: its own plugin registry (VMs and
/// their global state included) and its own action match sets.
struct PluginHost {
    registry: PluginRegistry,
    actions: ActionManager,
    ctx: Arc<WorkerContext>,
}

impl PluginHost {
    fn new(ctx: Arc<WorkerContext>) -> Self {
        let registry = PluginRegistry::new(
            ctx.plugin_repository.clone(),
            ctx.compiler.clone(),
            ctx.redis.clone(),
            ctx.jobs.clone(),
            ctx.instance_id,
        );
        let actions = ActionManager::new(ctx.action_repository.clone());
        Self {
            registry,
            actions,
            ctx,
        }
    }

    async fn init(&mut self) {
        if let Err(e) = self.registry.setup_plugins().await {
            error!("initial plugin setup failed: {}", e);
        }
        if let Err(e) = self.actions.reload_all().await {
            error!("initial action load failed: {}", e);
        }
    }

    async fn execute(&mut self, task: WorkerTask) -> TaskResult {
        match task {
            WorkerTask::ProcessEvent(event) => Ok(TaskOutcome::Event(
                self.registry.run_process_event(event).await,
            )),
            WorkerTask::ProcessEventBatch(events) => Ok(TaskOutcome::Events(
                self.registry.run_process_event_batch(events).await,
            )),
            WorkerTask::IngestEvent(event) => self.ingest(event).await,
            WorkerTask::MatchActions(event) => {
                Ok(TaskOutcome::Actions(self.actions.match_event(&event)))
            }
            WorkerTask::RunEveryMinute(id) => {
                self.registry.run_plugin_task(id, "runEveryMinute").await;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::RunEveryHour(id) => {
                self.registry.run_plugin_task(id, "runEveryHour").await;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::RunEveryDay(id) => {
                self.registry.run_plugin_task(id, "runEveryDay").await;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::GetPluginSchedule => Ok(TaskOutcome::Schedule(self.registry.schedule())),
            WorkerTask::ReloadPlugins => {
                self.registry.teardown_plugins().await;
                self.registry
                    .setup_plugins()
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::ReloadSchedule => {
                self.registry.load_schedule().await;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::ReloadAction(id) => {
                self.actions
                    .reload_action(id)
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::ReloadAllActions => {
                self.actions
                    .reload_all()
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::DropAction(id) => {
                self.actions.drop_action(id);
                Ok(TaskOutcome::Done)
            }
            WorkerTask::TeardownPlugins => {
                self.registry.teardown_plugins().await;
                Ok(TaskOutcome::Done)
            }
            WorkerTask::FlushQueuedWrites => {
                self.ctx
                    .processor
                    .flush_queued_writes()
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                Ok(TaskOutcome::Done)
            }
        }
    }

    async fn ingest(&mut self, event: PluginEvent) -> TaskResult {
        // Snapshots bypass the plugin pipeline
        let survived = if event.is_snapshot() {
            Some(event)
        } else {
            self.registry.run_process_event(event).await
        };

        let Some(event) = survived else {
            // A plugin dropped it; nothing is published downstream
            return Ok(TaskOutcome::Ingested { published: false });
        };

        if !self.ctx.ingestion_enabled {
            return Ok(TaskOutcome::Ingested { published: false });
        }

        match self.ctx.processor.process_event(&event).await {
            Ok(_) => {
                self.registry.run_on_event(&event).await;
                Ok(TaskOutcome::Ingested { published: true })
            }
            Err(e) => Err(TaskError::Failed(e.to_string())),
        }
    }
}

struct QueuedTask {
    task: WorkerTask,
    reply: oneshot::Sender<TaskResult>,
}

#[derive(Default)]
pub struct WorkerStats {
    pub completed: AtomicU64,
    pub busy_millis: AtomicU64,
}

struct WorkerHandle {
    tx: mpsc::Sender<QueuedTask>,
    queued: Arc<AtomicUsize>,
    stats: Arc<WorkerStats>,
}

/// The fixed worker pool. Dispatch picks the shortest queue; each worker
/// pulls and executes to completion under the per-task deadline.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn spawn(
        ctx: Arc<WorkerContext>,
        worker_count: usize,
        tasks_per_worker: usize,
        task_timeout: Duration,
    ) -> WorkerPool {
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for index in 0..worker_count.max(1) {
            let (tx, rx) = mpsc::channel(tasks_per_worker.max(1));
            let queued = Arc::new(AtomicUsize::new(0));
            let stats = Arc::new(WorkerStats::default());
            tokio::spawn(worker_loop(
                index,
                ctx.clone(),
                rx,
                queued.clone(),
                stats.clone(),
                task_timeout,
            ));
            workers.push(WorkerHandle { tx, queued, stats });
        }
        WorkerPool { workers }
    }

    /// Submit one task and wait for its tagged result.
    pub async fn run_task(&self, task: WorkerTask) -> TaskResult {
        let (reply, rx) = oneshot::channel();
        let worker = self
            .workers
            .iter()
            .min_by_key(|w| w.queued.load(Ordering::Relaxed))
            .expect("pool has at least one worker");

        worker.queued.fetch_add(1, Ordering::Relaxed);
        if worker.tx.send(QueuedTask { task, reply }).await.is_err() {
            worker.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::Failed("worker pool is shut down".to_string()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Failed("worker dropped the task".to_string())),
        }
    }

    /// Send a control-plane task to every worker and collect all results.
    pub async fn broadcast(&self, task: WorkerTask) -> Vec<TaskResult> {
        let mut receivers = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (reply, rx) = oneshot::channel();
            worker.queued.fetch_add(1, Ordering::Relaxed);
            if worker
                .tx
                .send(QueuedTask {
                    task: task.clone(),
                    reply,
                })
                .await
                .is_err()
            {
                worker.queued.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
            receivers.push(rx);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(match rx.await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Failed("worker dropped the task".to_string())),
            });
        }
        results
    }

    /// Tasks accepted but not yet picked up by a worker.
    pub fn queue_size(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.queued.load(Ordering::Relaxed))
            .sum()
    }

    /// Tasks executed to completion (including failures and timeouts).
    pub fn completed(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.stats.completed.load(Ordering::Relaxed))
            .sum()
    }

    /// Total wall-clock spent executing tasks across all workers.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(
            self.workers
                .iter()
                .map(|w| w.stats.busy_millis.load(Ordering::Relaxed))
                .sum(),
        )
    }

    /// Tear down plugins everywhere and stop accepting work.
    pub async fn shutdown(self) {
        self.broadcast(WorkerTask::FlushQueuedWrites).await;
        self.broadcast(WorkerTask::TeardownPlugins).await;
        info!("worker pool shut down after {} tasks", self.completed());
        // Dropping the senders ends every worker loop
    }
}

async fn worker_loop(
    index: usize,
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::Receiver<QueuedTask>,
    queued: Arc<AtomicUsize>,
    stats: Arc<WorkerStats>,
    task_timeout: Duration,
) {
    let mut host = PluginHost::new(ctx);
    host.init().await;
    info!(worker = index, "plugin worker ready");

    while let Some(QueuedTask { task, reply }) = rx.recv().await {
        queued.fetch_sub(1, Ordering::Relaxed);
        let kind = task.kind();
        let started = Instant::now();

        // On expiry the in-flight future is dropped, which abandons the task
        // and leaves the worker free for the next one
        let result = match timeout(task_timeout, host.execute(task)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(TASKS_TIMED_OUT, "kind" => kind).increment(1);
                Err(TaskError::Timeout)
            }
        };

        let elapsed = started.elapsed();
        stats.completed.fetch_add(1, Ordering::Relaxed);
        stats
            .busy_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        metrics::histogram!(TASK_EXECUTION_TIME, "kind" => kind)
            .record(elapsed.as_millis() as f64);
        match &result {
            Ok(_) => metrics::counter!(TASKS_COMPLETED, "kind" => kind).increment(1),
            Err(_) => metrics::counter!(TASKS_FAILED, "kind" => kind).increment(1),
        }

        // The submitter may have gone away; that's fine
        let _ = reply.send(result);
    }
}
