use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use common_redis::{Client as RedisClientTrait, RedisClient};

use crate::config::Config;
use crate::consumer::QueueConsumer;
use crate::error::ServerError;
use crate::ingestion::sink::{EventSink, KafkaEventSink, PrintSink};
use crate::ingestion::{EventProcessor, PersonResolver, TeamManager};
use crate::jobs::JobQueue;
use crate::plugins::builtin::default_library;
use crate::scheduler::ScheduleCoordinator;
use crate::store::PostgresStore;
use crate::worker::{WorkerContext, WorkerPool};

/// Everything the process shares: the pools, the producer-backed sink, the
/// worker pool, and the two long-running loops. Built once in `main`.
pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub pool: PgPool,
    pub redis: Arc<dyn RedisClientTrait>,
    pub store: Arc<PostgresStore>,
    pub worker_pool: Arc<WorkerPool>,
    pub queue_consumer: QueueConsumer,
    pub scheduler: ScheduleCoordinator,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, ServerError> {
        let health_registry = HealthRegistry::new("liveness");
        let kafka_liveness: HealthHandle = health_registry
            .register("rdkafka".to_string(), Duration::from_secs(60))
            .await;
        let consumer_liveness = health_registry
            .register("consumer".to_string(), Duration::from_secs(60))
            .await;
        let scheduler_liveness = health_registry
            .register("scheduler".to_string(), Duration::from_secs(60))
            .await;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect(&config.database_url)
            .await?;

        let redis: Arc<dyn RedisClientTrait> =
            Arc::new(RedisClient::new(config.redis_url.clone()).await?);

        let sink: Arc<dyn EventSink> = if config.kafka.kafka_enabled {
            let producer = create_kafka_producer(&config.kafka, kafka_liveness).await?;
            Arc::new(KafkaEventSink::new(producer))
        } else {
            info!("kafka disabled, printing events instead of publishing");
            Arc::new(PrintSink {})
        };

        let store = Arc::new(PostgresStore::new(pool.clone()));
        let teams = Arc::new(TeamManager::new(
            store.clone(),
            Duration::from_secs(config.team_cache_ttl_seconds),
        ));
        let persons = PersonResolver::new(store.clone(), sink.clone());
        let processor = Arc::new(EventProcessor::new(teams, persons, sink));

        let jobs = JobQueue::new(redis.clone(), config.plugins_celery_queue.clone());
        let worker_context = Arc::new(WorkerContext {
            plugin_repository: store.clone(),
            compiler: Arc::new(default_library()),
            action_repository: store.clone(),
            processor,
            redis: redis.clone(),
            jobs,
            instance_id: Uuid::now_v7(),
            ingestion_enabled: config.plugin_server_ingestion,
        });
        let worker_pool = Arc::new(WorkerPool::spawn(
            worker_context,
            config.worker_concurrency,
            config.tasks_per_worker,
            Duration::from_secs(config.task_timeout),
        ));

        let queue_consumer = QueueConsumer::new(
            SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())?,
            worker_pool.clone(),
            config.task_capacity(),
            consumer_liveness,
        );

        let scheduler = ScheduleCoordinator::new(
            redis.clone(),
            worker_pool.clone(),
            config.scheduler_lock_resource.clone(),
            config.scheduler_lock_ttl_seconds,
            scheduler_liveness,
        );

        Ok(Self {
            health_registry,
            pool,
            redis,
            store,
            worker_pool,
            queue_consumer,
            scheduler,
        })
    }
}
