use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use health::HealthHandle;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use common_redis::{Client as RedisClientTrait, CustomRedisError};

use crate::metrics_consts::{SCHEDULED_TASKS_SUBMITTED, SCHEDULER_LEADER};
use crate::plugins::schedule::Periodicity;
use crate::worker::{TaskOutcome, WorkerPool, WorkerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderState {
    Follower,
    Acquiring,
    Leader,
}

/// Elects a singleton among replicas through a TTL'd redis lock, and drives
/// the minute/hour/day plugin tasks while holding it.
///
/// The holder re-extends at TTL/2 and demotes itself the moment an extension
/// fails, cancelling its in-progress scheduled work. Followers retry
/// acquisition every TTL/10 (plus jitter so replicas don't stampede).
pub struct ScheduleCoordinator {
    redis: Arc<dyn RedisClientTrait>,
    pool: Arc<WorkerPool>,
    resource: String,
    ttl_seconds: u64,
    token: String,
    liveness: HealthHandle,
}

impl ScheduleCoordinator {
    pub fn new(
        redis: Arc<dyn RedisClientTrait>,
        pool: Arc<WorkerPool>,
        resource: impl Into<String>,
        ttl_seconds: u64,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            redis,
            pool,
            resource: resource.into(),
            ttl_seconds: ttl_seconds.max(2),
            token: Uuid::now_v7().to_string(),
            liveness,
        }
    }

    pub async fn run(&self) {
        let mut state = LeaderState::Follower;
        loop {
            self.liveness.report_healthy().await;
            state = match state {
                LeaderState::Follower => {
                    tokio::time::sleep(self.retry_delay()).await;
                    LeaderState::Acquiring
                }
                LeaderState::Acquiring => match self.acquire().await {
                    Ok(true) => {
                        info!(resource = self.resource, "became scheduler leader");
                        metrics::gauge!(SCHEDULER_LEADER).set(1.0);
                        LeaderState::Leader
                    }
                    Ok(false) => LeaderState::Follower,
                    Err(e) => {
                        warn!("lock acquisition failed: {}", e);
                        LeaderState::Follower
                    }
                },
                LeaderState::Leader => {
                    self.lead().await;
                    metrics::gauge!(SCHEDULER_LEADER).set(0.0);
                    info!(resource = self.resource, "lost scheduler leadership");
                    LeaderState::Follower
                }
            };
        }
    }

    fn retry_delay(&self) -> Duration {
        let base_ms = self.ttl_seconds * 1000 / 10;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
        Duration::from_millis(base_ms + jitter_ms)
    }

    async fn acquire(&self) -> Result<bool, CustomRedisError> {
        self.redis
            .set_nx_ex(self.resource.clone(), self.token.clone(), self.ttl_seconds)
            .await
    }

    /// Still the holder? Re-extend only when the stored token is ours; a
    /// mismatch or a vanished key means the lease is gone.
    async fn extend(&self) -> bool {
        match self.redis.get(self.resource.clone()).await {
            Ok(token) if token == self.token => self
                .redis
                .expire(self.resource.clone(), self.ttl_seconds)
                .await
                .unwrap_or(false),
            Ok(_) | Err(CustomRedisError::NotFound) => false,
            Err(e) => {
                warn!("lock extension failed: {}", e);
                false
            }
        }
    }

    /// Run scheduled dispatch until the lease is lost. Never holds the lock
    /// past its TTL: any extension failure aborts in-progress scheduled work
    /// and returns immediately.
    async fn lead(&self) {
        let ttl = Duration::from_secs(self.ttl_seconds);
        let mut extend_timer = interval_at(Instant::now() + ttl / 2, ttl / 2);
        let mut tick_timer = interval(Duration::from_secs(1));
        let mut last_tick = Utc::now();
        let mut in_progress: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = extend_timer.tick() => {
                    if !self.extend().await {
                        in_progress.abort_all();
                        return;
                    }
                }
                _ = tick_timer.tick() => {
                    self.liveness.report_healthy().await;
                    let now = Utc::now();
                    for periodicity in due_periodicities(last_tick, now) {
                        self.dispatch(periodicity, &mut in_progress).await;
                    }
                    last_tick = now;
                }
            }
        }
    }

    /// Submit one task per (periodicity, config) tuple for this tick.
    async fn dispatch(&self, periodicity: Periodicity, in_progress: &mut JoinSet<()>) {
        let schedule = match self.pool.run_task(WorkerTask::GetPluginSchedule).await {
            Ok(TaskOutcome::Schedule(Some(schedule))) => schedule,
            Ok(TaskOutcome::Schedule(None)) => {
                // Not built yet; kick off a load and wait for the next tick
                if let Err(e) = self.pool.run_task(WorkerTask::ReloadSchedule).await {
                    warn!("schedule load failed: {}", e);
                }
                return;
            }
            Ok(_) | Err(_) => return,
        };

        for config_id in schedule.bucket(periodicity) {
            metrics::counter!(SCHEDULED_TASKS_SUBMITTED, "periodicity" => periodicity.task_name())
                .increment(1);
            let pool = self.pool.clone();
            let task = match periodicity {
                Periodicity::Minute => WorkerTask::RunEveryMinute(*config_id),
                Periodicity::Hour => WorkerTask::RunEveryHour(*config_id),
                Periodicity::Day => WorkerTask::RunEveryDay(*config_id),
            };
            in_progress.spawn(async move {
                if let Err(e) = pool.run_task(task).await {
                    warn!("scheduled task failed: {}", e);
                }
            });
        }
    }
}

/// Which cadences crossed a wall-clock boundary between two instants. Edge
/// triggered: a multi-minute gap still yields each cadence once, because
/// missed ticks are not backfilled.
fn due_periodicities(prev: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Periodicity> {
    let mut due = Vec::new();
    if now.timestamp() / 60 != prev.timestamp() / 60 {
        due.push(Periodicity::Minute);
    }
    if now.timestamp() / 3600 != prev.timestamp() / 3600 {
        due.push(Periodicity::Hour);
    }
    if now.timestamp() / 86_400 != prev.timestamp() / 86_400 {
        due.push(Periodicity::Day);
    }
    due
}
