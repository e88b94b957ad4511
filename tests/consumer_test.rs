//! End-to-end worker pool behavior over the in-memory transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use workq::config::{
    DelayBehavior, ErrorPolicy, PolicyConfiguration, QueueConfiguration, Retention,
    RetryDelayBehavior, WorkerConfiguration,
};
use workq::engine::{HandlerError, Queue, handler_fn};
use workq::error::{Error, Result};
use workq::model::{ClaimFilter, CountFilter, Message, MessageId, NewMessage, Status, WorkerId};
use workq::transport::{Capabilities, MemoryTransport, StatusUpdate, Transport};

fn fast_config(workers: usize) -> QueueConfiguration {
    QueueConfiguration {
        worker: WorkerConfiguration {
            worker_count: workers,
            single_worker_when_no_work_found: false,
            time_to_wait_for_workers_to_stop: Duration::from_secs(5),
            time_to_wait_for_workers_to_cancel: Duration::from_secs(1),
            ..WorkerConfiguration::default()
        },
        queue_delay_behavior: DelayBehavior::from_millis(&[1, 5, 10]),
        fatal_exception_delay_behavior: DelayBehavior::from_millis(&[1]),
        retention: Retention::Archive,
        ..QueueConfiguration::default()
    }
}

fn queue_with(config: QueueConfiguration) -> Queue {
    Queue::builder(Arc::new(MemoryTransport::new("consumer")))
        .configuration(config)
        .build()
        .unwrap()
}

async fn count(queue: &Queue, status: Status) -> u64 {
    queue
        .count(&CountFilter::default().status(status))
        .await
        .unwrap()
}

/// Poll until `status` holds `expected` messages or the deadline passes.
async fn wait_for(queue: &Queue, status: Status, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while count(queue, status).await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected} {status} messages"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send(queue: &Queue, message: NewMessage) -> MessageId {
    let result = queue.producer().send(message).await;
    assert!(!result.has_error(), "send failed: {:?}", result.error);
    result.id.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_workers_complete_a_thousand_messages() {
    let queue = queue_with(fast_config(5));
    let batch = (0..1000).map(|i| NewMessage::new("job", format!("{i}")));
    let results = queue.producer().send_batch(batch).await;
    assert!(results.iter().all(|r| !r.has_error()));
    assert_eq!(queue.pending_count().await.unwrap(), 1000);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(move |_message, _notification| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();

    wait_for(&queue, Status::Complete, 1000).await;
    assert_eq!(consumer.pending_count().await.unwrap(), 0);
    consumer.stop().await;

    assert_eq!(handled.load(Ordering::SeqCst), 1000);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert_eq!(count(&queue, Status::Working).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parked_workers_join_in_when_work_arrives() {
    let config = QueueConfiguration {
        worker: WorkerConfiguration {
            single_worker_when_no_work_found: true,
            ..fast_config(4).worker
        },
        ..fast_config(4)
    };
    let queue = queue_with(config);

    let workers = Arc::new(Mutex::new(HashSet::new()));
    let seen = workers.clone();
    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(move |_message, notification| {
            seen.lock().insert(notification.worker_id().clone());
            async {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(())
            }
        }))
        .unwrap();

    // Every loop finds the queue empty and all but one park.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 0..40 {
        send(&queue, NewMessage::new("job", format!("{i}"))).await;
    }

    wait_for(&queue, Status::Complete, 40).await;
    consumer.stop().await;
    assert!(workers.lock().len() > 1, "only one worker processed messages");
}

/// Fails the first `failures` claims with a non-retryable fault.
struct FailingClaims {
    inner: MemoryTransport,
    failures: usize,
    claims: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Transport for FailingClaims {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn create_queue(&self) -> Result<()> {
        self.inner.create_queue().await
    }

    async fn remove_queue(&self) -> Result<()> {
        self.inner.remove_queue().await
    }

    async fn enqueue(&self, message: Message) -> Result<MessageId> {
        self.inner.enqueue(message).await
    }

    async fn try_claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let attempt = {
            let mut claims = self.claims.lock();
            claims.push(Instant::now());
            claims.len()
        };
        if attempt <= self.failures {
            return Err(Error::Other("storage offline".into()));
        }
        self.inner.try_claim(worker, filter, now).await
    }

    async fn update_status(
        &self,
        id: MessageId,
        update: &StatusUpdate,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        self.inner.update_status(id, update, expected_version, now).await
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        self.inner.get(id).await
    }

    async fn count(&self, filter: &CountFilter) -> Result<u64> {
        self.inner.count(filter).await
    }

    async fn reset_heartbeat(
        &self,
        id: MessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.reset_heartbeat(id, worker, now).await
    }

    async fn reclaim_dead(
        &self,
        now: DateTime<Utc>,
        dead_time: Duration,
        lookback: Option<Duration>,
    ) -> Result<Vec<MessageId>> {
        self.inner.reclaim_dead(now, dead_time, lookback).await
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<MessageId>> {
        self.inner.expire_due(now).await
    }

    async fn promote_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.promote_delayed(now).await
    }
}

#[tokio::test]
async fn claim_faults_back_off_then_recover() {
    let transport = Arc::new(FailingClaims {
        inner: MemoryTransport::new("failing"),
        failures: 3,
        claims: Mutex::new(Vec::new()),
    });
    let config = QueueConfiguration {
        fatal_exception_delay_behavior: DelayBehavior::from_millis(&[50, 100]),
        ..fast_config(1)
    };
    let queue = Queue::builder(transport.clone())
        .configuration(config)
        .build()
        .unwrap();
    send(&queue, NewMessage::new("job", "x")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, _notification| async { Ok(()) }))
        .unwrap();

    wait_for(&queue, Status::Complete, 1).await;
    consumer.stop().await;

    let claims = transport.claims.lock().clone();
    assert!(claims.len() >= 4);
    let gaps: Vec<Duration> = claims.windows(2).take(3).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(50), "gaps: {gaps:?}");
    assert!(gaps[1] >= Duration::from_millis(100), "gaps: {gaps:?}");
    // Clamped at the last step.
    assert!(gaps[2] >= Duration::from_millis(100), "gaps: {gaps:?}");
}

#[tokio::test]
async fn failures_are_requeued_until_retry_steps_run_out() {
    let config = QueueConfiguration {
        retry_delay_behavior: RetryDelayBehavior::none()
            .with(RetryDelayBehavior::DEFAULT_KIND, DelayBehavior::from_millis(&[0, 0])),
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "doomed")).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(move |_message, _notification| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::msg("downstream refused")) }
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 1).await;
    consumer.stop().await;

    let message = queue.get(id).await.unwrap().unwrap();
    assert_eq!(message.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(message.last_error.unwrap().contains("downstream refused"));
}

#[tokio::test]
async fn error_kind_selects_its_own_retry_steps() {
    let config = QueueConfiguration {
        retry_delay_behavior: RetryDelayBehavior::none()
            .with("throttled", DelayBehavior::from_millis(&[0, 0, 0, 0])),
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let throttled = send(&queue, NewMessage::new("throttle", "t")).await;
    let broken = send(&queue, NewMessage::new("broken", "b")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|message, _notification| async move {
            if message.message_type == "throttle" {
                Err(HandlerError::new("throttled", "slow down"))
            } else {
                Err(HandlerError::new("fatal", "corrupt body"))
            }
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 2).await;
    consumer.stop().await;

    assert_eq!(queue.get(throttled).await.unwrap().unwrap().attempt_count, 5);
    // No "default" sequence, so unknown kinds fail on the first attempt.
    assert_eq!(queue.get(broken).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn each_error_kind_spends_only_its_own_steps() {
    let config = QueueConfiguration {
        retry_delay_behavior: RetryDelayBehavior::none()
            .with("io", DelayBehavior::from_millis(&[0, 0]))
            .with("timeout", DelayBehavior::from_millis(&[0])),
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "flaky")).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(move |_message, _notification| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(HandlerError::new("io", "connection reset"))
                } else {
                    Err(HandlerError::new("timeout", "deadline exceeded"))
                }
            }
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 1).await;
    consumer.stop().await;

    // io once, then timeout until its single step is spent.
    let message = queue.get(id).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(message.attempt_count, 3);
    assert_eq!(message.failures_of("io"), 1);
    assert_eq!(message.failures_of("timeout"), 2);
}

#[tokio::test]
async fn rollback_does_not_spend_retry_steps() {
    let config = QueueConfiguration {
        retry_delay_behavior: RetryDelayBehavior::none()
            .with(RetryDelayBehavior::DEFAULT_KIND, DelayBehavior::from_millis(&[0])),
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "x")).await;

    let transport = queue.transport();
    let claimed = transport
        .try_claim(&WorkerId::from("earlier"), &ClaimFilter::default(), Utc::now())
        .await
        .unwrap()
        .unwrap();
    transport
        .update_status(id, &StatusUpdate::rollback(), claimed.version, Utc::now())
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(move |_message, _notification| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::msg("still broken")) }
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 1).await;
    consumer.stop().await;

    let message = queue.get(id).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(message.attempt_count, 3);
}

#[tokio::test]
async fn terminal_error_policy_never_requeues() {
    let config = QueueConfiguration {
        error_policy: ErrorPolicy::Terminal,
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "x")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, _notification| async {
            Err(HandlerError::msg("no"))
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 1).await;
    consumer.stop().await;
    assert_eq!(queue.get(id).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn handler_panic_is_recorded_as_failure() {
    let config = QueueConfiguration {
        error_policy: ErrorPolicy::Terminal,
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "x")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|message, _notification| async move {
            if message.body == b"x" {
                panic!("handler bug");
            }
            Ok(())
        }))
        .unwrap();

    wait_for(&queue, Status::Error, 1).await;
    consumer.stop().await;

    let message = queue.get(id).await.unwrap().unwrap();
    assert!(message.last_error.unwrap().starts_with("panic"));
}

#[tokio::test]
async fn stop_cancels_in_flight_handler_and_rolls_back() {
    let queue = queue_with(fast_config(1));
    let id = send(&queue, NewMessage::new("job", "long")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, notification| async move {
            assert!(notification.rollback_supported());
            notification.cancelled().await;
            Err(HandlerError::cancelled())
        }))
        .unwrap();

    wait_for(&queue, Status::Working, 1).await;
    while consumer.claims_in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    consumer.stop().await;

    let message = queue.get(id).await.unwrap().unwrap();
    assert_eq!(message.status, Status::Pending);
    assert_eq!(message.attempt_count, 1);
    assert!(message.lock_owner.is_none());
    assert!(message.last_error.is_none());
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn stop_abandons_handlers_that_ignore_cancellation() {
    let config = QueueConfiguration {
        worker: WorkerConfiguration {
            abort_worker_threads_when_stopping: true,
            time_to_wait_for_workers_to_stop: Duration::from_millis(50),
            time_to_wait_for_workers_to_cancel: Duration::from_millis(50),
            ..fast_config(1).worker
        },
        ..fast_config(1)
    };
    let queue = queue_with(config);
    let id = send(&queue, NewMessage::new("job", "stuck")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, _notification| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }))
        .unwrap();

    wait_for(&queue, Status::Working, 1).await;
    tokio::time::timeout(Duration::from_secs(5), consumer.stop())
        .await
        .expect("stop should not wait for the stuck handler");

    // Left for heartbeat reclamation.
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, Status::Working);
}

#[tokio::test]
async fn cancelled_handler_without_rollback_is_left_working() {
    let transport = MemoryTransport::new("no-rollback").with_capabilities(Capabilities {
        rollback: false,
        ..Capabilities::ALL
    });
    let queue = Queue::builder(Arc::new(transport))
        .configuration(fast_config(1))
        .build()
        .unwrap();
    let id = send(&queue, NewMessage::new("job", "x")).await;

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, notification| async move {
            assert!(!notification.rollback_supported());
            notification.cancelled().await;
            Err(HandlerError::cancelled())
        }))
        .unwrap();

    wait_for(&queue, Status::Working, 1).await;
    consumer.stop().await;
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, Status::Working);
}

#[tokio::test]
async fn configuration_is_frozen_while_running() {
    let queue = queue_with(fast_config(2));
    let mut consumer = queue.consumer();
    consumer.configuration_mut().unwrap().worker.worker_count = 3;

    consumer
        .start(handler_fn(|_message, _notification| async { Ok(()) }))
        .unwrap();
    assert!(consumer.configuration_mut().is_err());
    assert_eq!(consumer.configuration().worker.worker_count, 3);
    assert!(
        consumer
            .start(handler_fn(|_message, _notification| async { Ok(()) }))
            .is_err()
    );

    consumer.stop().await;
    assert!(consumer.configuration_mut().is_ok());
}

#[tokio::test]
async fn purge_retention_deletes_finished_messages() {
    let config = QueueConfiguration {
        retention: Retention::Purge,
        ..fast_config(2)
    };
    let queue = queue_with(config);
    for i in 0..10 {
        send(&queue, NewMessage::new("job", format!("{i}"))).await;
    }

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, _notification| async { Ok(()) }))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while queue.count(&CountFilter::default()).await.unwrap() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "messages were not purged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_faults_are_absorbed_by_the_policies() {
    let config = QueueConfiguration {
        policies: PolicyConfiguration {
            retry_count: 2,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
            enable_chaos: true,
            chaos_injection_rate: 1.0,
        },
        ..fast_config(3)
    };
    let queue = queue_with(config);
    for i in 0..50 {
        send(&queue, NewMessage::new("job", format!("{i}"))).await;
    }

    let mut consumer = queue.consumer();
    consumer
        .start(handler_fn(|_message, _notification| async { Ok(()) }))
        .unwrap();

    wait_for(&queue, Status::Complete, 50).await;
    consumer.stop().await;
    assert_eq!(queue.pending_count().await.unwrap(), 0);
}
