use std::sync::Arc;

use base64::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

use common_redis::{Client as RedisClientTrait, CustomRedisError};

/// The legacy work queue: celery-shaped JSON envelopes pushed onto a redis
/// list, drained by the python side. Plugin jobs and post-ingest followups
/// ride on it.
#[derive(Clone)]
pub struct JobQueue {
    redis: Arc<dyn RedisClientTrait>,
    queue: String,
}

pub const PLUGIN_JOB_TASK: &str = "posthog.tasks.plugins.plugin_job";

impl JobQueue {
    pub fn new(redis: Arc<dyn RedisClientTrait>, queue: impl Into<String>) -> Self {
        Self {
            redis,
            queue: queue.into(),
        }
    }

    /// Push one task envelope in the wire shape celery's redis transport
    /// expects: JSON with a base64 body of `[args, kwargs, embed]`.
    pub async fn enqueue(
        &self,
        task: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<(), CustomRedisError> {
        let id = Uuid::now_v7();
        let body = BASE64_STANDARD.encode(json!([args, kwargs, Value::Null]).to_string());
        let message = json!({
            "body": body,
            "content-encoding": "utf-8",
            "content-type": "application/json",
            "headers": {
                "lang": "rs",
                "task": task,
                "id": id,
                "root_id": id,
                "parent_id": Value::Null,
                "group": Value::Null,
            },
            "properties": {
                "correlation_id": id,
                "delivery_mode": 2,
                "delivery_tag": Uuid::now_v7(),
                "delivery_info": { "exchange": "", "routing_key": self.queue },
                "priority": 0,
                "body_encoding": "base64",
            },
        });

        self.redis.lpush(self.queue.clone(), message.to_string()).await
    }

    /// Dispatch a named plugin job for one config.
    pub async fn enqueue_plugin_job(
        &self,
        plugin_config_id: i32,
        job_name: &str,
        payload: Value,
    ) -> Result<(), CustomRedisError> {
        self.enqueue(
            PLUGIN_JOB_TASK,
            json!([]),
            json!({
                "pluginConfigId": plugin_config_id,
                "type": job_name,
                "payload": payload,
            }),
        )
        .await
    }

    pub async fn depth(&self) -> Result<u64, CustomRedisError> {
        self.redis.llen(self.queue.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;

    #[tokio::test]
    async fn envelopes_are_celery_shaped() {
        let redis = MockRedisClient::new();
        let queue = JobQueue::new(Arc::new(redis.clone()), "posthog-plugins");

        queue
            .enqueue_plugin_job(7, "exportHistoricalEvents", json!({"retries": 3}))
            .await
            .unwrap();

        assert_eq!(redis.list_len("posthog-plugins"), 1);
        let raw = redis.rpop("posthog-plugins".to_string()).await.unwrap().unwrap();
        let message: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(message["headers"]["task"], PLUGIN_JOB_TASK);
        assert_eq!(message["properties"]["body_encoding"], "base64");

        let body = BASE64_STANDARD
            .decode(message["body"].as_str().unwrap())
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body[1]["pluginConfigId"], 7);
        assert_eq!(body[1]["type"], "exportHistoricalEvents");
    }
}
