use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use common_kafka::kafka_consumer::{RecvErr, SingleTopicConsumer};
use common_types::{PluginEvent, RawEvent};

use crate::error::ServerError;
use crate::metrics_consts::{
    CONSUMER_PAUSED, EVENTS_DROPPED, EVENTS_RECEIVED, TASKS_IN_FLIGHT,
};
use crate::worker::{WorkerPool, WorkerTask};

/// Bounds outstanding work at `C = workers * tasks_per_worker`. The
/// semaphore is the hard ceiling; the two thresholds are level signals:
/// "at capacity, stop polling" and "at C/2 or below, poll again".
pub struct Backpressure {
    slots: Arc<Semaphore>,
    capacity: usize,
    resume_at: usize,
    in_flight: AtomicUsize,
}

pub struct Admission {
    _permit: tokio::sync::OwnedSemaphorePermit,
    /// The pool is saturated; polling should stop until drained to C/2
    pub should_pause: bool,
}

impl Backpressure {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            resume_at: capacity / 2,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Claim a slot, waiting when all are taken. The wait only happens if
    /// the broker hands over messages it fetched before we paused.
    pub async fn admit(&self) -> Admission {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("backpressure semaphore is never closed");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(TASKS_IN_FLIGHT).set(now as f64);

        Admission {
            _permit: permit,
            should_pause: now >= self.capacity,
        }
    }

    /// Release a slot; returns true when polling may resume. Level
    /// triggered, so a late resume signal is never lost.
    pub fn on_complete(&self) -> bool {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!(TASKS_IN_FLIGHT).set(now as f64);
        now <= self.resume_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Serializes broker pause/resume transitions. The flag and the client call
/// flip under one lock, so a pause and a racing resume can never interleave
/// into a stuck consumer.
struct PauseGate {
    consumer: SingleTopicConsumer,
    paused: Mutex<bool>,
}

impl PauseGate {
    fn pause(&self) {
        let mut paused = match self.paused.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *paused {
            return;
        }
        match self.consumer.pause() {
            Ok(()) => {
                *paused = true;
                metrics::gauge!(CONSUMER_PAUSED).set(1.0);
            }
            Err(e) => warn!("failed to pause consumer: {}", e),
        }
    }

    fn resume(&self) {
        let mut paused = match self.paused.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*paused {
            return;
        }
        match self.consumer.resume() {
            Ok(()) => {
                *paused = false;
                metrics::gauge!(CONSUMER_PAUSED).set(0.0);
            }
            Err(e) => warn!("failed to resume consumer: {}", e),
        }
    }

    fn is_paused(&self) -> bool {
        match self.paused.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Drains the ingress topic and feeds the worker pool, one pipeline task
/// per message. Offsets are stored only once the task resolves successfully;
/// anything else stays uncommitted for redelivery.
pub struct QueueConsumer {
    consumer: SingleTopicConsumer,
    pool: Arc<WorkerPool>,
    backpressure: Arc<Backpressure>,
    gate: Arc<PauseGate>,
    liveness: HealthHandle,
    shutdown: watch::Sender<bool>,
}

impl QueueConsumer {
    pub fn new(
        consumer: SingleTopicConsumer,
        pool: Arc<WorkerPool>,
        capacity: usize,
        liveness: HealthHandle,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let gate = Arc::new(PauseGate {
            consumer: consumer.clone(),
            paused: Mutex::new(false),
        });
        Self {
            consumer,
            pool,
            backpressure: Arc::new(Backpressure::new(capacity)),
            gate,
            liveness,
            shutdown,
        }
    }

    pub fn backpressure(&self) -> Arc<Backpressure> {
        self.backpressure.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Run until a fatal broker error or `stop`. Task-level failures never
    /// end the loop; they are recorded against the offending plugin and the
    /// message is left uncommitted.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        info!("queue consumer draining");

        loop {
            self.liveness.report_healthy().await;

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.consumer.json_recv::<RawEvent>() => received,
            };

            let (raw, offset) = match received {
                Ok(r) => r,
                Err(RecvErr::Kafka(e)) => {
                    // Fatal channel: a dead consumer group aborts the process
                    return Err(e.into());
                }
                Err(err) => {
                    // Poison pill; its offset is already stored for us
                    metrics::counter!(EVENTS_DROPPED, "cause" => "recv").increment(1);
                    error!("error receiving message: {:?}", err);
                    continue;
                }
            };
            metrics::counter!(EVENTS_RECEIVED).increment(1);

            let event = match PluginEvent::from_raw(&raw) {
                Ok(event) => event,
                Err(e) => {
                    // Input validation failure: drop the event, surface the
                    // error, move on
                    metrics::counter!(EVENTS_DROPPED, "cause" => "invalid").increment(1);
                    warn!(team_id = raw.team_id, "dropping undecodable event: {}", e);
                    if let Err(e) = offset.store() {
                        warn!("failed to store offset of dropped event: {}", e);
                    }
                    continue;
                }
            };

            let admission = self.backpressure.admit().await;
            if admission.should_pause {
                self.gate.pause();
            }

            let pool = self.pool.clone();
            let gate = self.gate.clone();
            let backpressure = self.backpressure.clone();
            tokio::spawn(async move {
                match pool.run_task(WorkerTask::IngestEvent(event)).await {
                    Ok(_) => {
                        if let Err(e) = offset.store() {
                            warn!("failed to store offset: {}", e);
                        }
                    }
                    Err(e) => {
                        // Leave the offset unstored; at-least-once redelivery
                        // picks this up after a restart
                        error!("pipeline task failed: {}", e);
                    }
                }

                drop(admission);
                if backpressure.on_complete() {
                    gate.resume();
                }
            });
        }

        self.drain().await;
        Ok(())
    }

    /// Stop pulling, wait for in-flight tasks, then leave the group.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.drain().await;
        self.consumer.unsubscribe();
    }

    async fn drain(&self) {
        while self.backpressure.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Idempotent; exposed for operational tooling.
    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saturation_and_drain_levels() {
        let bp = Backpressure::new(4);

        let mut admissions = Vec::new();
        for i in 0..3 {
            let admission = bp.admit().await;
            assert!(!admission.should_pause, "admission {i} should not pause");
            admissions.push(admission);
        }

        // Fourth slot is saturation
        let admission = bp.admit().await;
        assert!(admission.should_pause);
        assert_eq!(bp.in_flight(), 4);
        admissions.push(admission);

        // 4 -> 3: still above the resume threshold
        drop(admissions.pop());
        assert!(!bp.on_complete());

        // 3 -> 2 = C/2: resume level reached
        drop(admissions.pop());
        assert!(bp.on_complete());

        // Below C/2 the level holds, so a missed signal is re-sent
        drop(admissions.pop());
        assert!(bp.on_complete());
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_capacity() {
        let bp = Arc::new(Backpressure::new(2));

        let first = bp.admit().await;
        let _second = bp.admit().await;
        assert_eq!(bp.in_flight(), 2);

        // A third admission must wait for a slot
        let waiting = {
            let bp = bp.clone();
            tokio::spawn(async move {
                let _admission = bp.admit().await;
                bp.in_flight()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(first);
        bp.on_complete();
        assert!(waiting.await.unwrap() <= 2);
    }

    #[tokio::test]
    async fn repeated_saturation_cycles_are_stable() {
        let bp = Backpressure::new(2);
        for _ in 0..5 {
            let a = bp.admit().await;
            assert!(!a.should_pause);
            let b = bp.admit().await;
            assert!(b.should_pause);
            drop(a);
            assert!(bp.on_complete());
            drop(b);
            assert!(bp.on_complete());
            assert_eq!(bp.in_flight(), 0);
        }
    }
}
