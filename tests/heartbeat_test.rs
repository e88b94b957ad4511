//! Heartbeat refresh and reclamation of silent claims.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use workq::clock::{Clock, ManualClock};
use workq::config::{HeartBeatConfiguration, QueueConfiguration, ThreadPoolConfiguration};
use workq::engine::Queue;
use workq::model::{ClaimFilter, Message, NewMessage, Status, WorkerId};
use workq::transport::{MemoryTransport, Transport};

fn queue_with(clock: &ManualClock, heartbeat: HeartBeatConfiguration) -> Queue {
    let config = QueueConfiguration {
        heartbeat,
        ..QueueConfiguration::default()
    };
    Queue::builder(Arc::new(MemoryTransport::new("heartbeat")))
        .configuration(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

fn thirty_seconds() -> HeartBeatConfiguration {
    HeartBeatConfiguration {
        time: Duration::from_secs(30),
        thread_pool: ThreadPoolConfiguration {
            threads_min: 1,
            threads_max: 4,
            thread_idle_timeout: Duration::from_secs(1),
        },
        ..HeartBeatConfiguration::default()
    }
}

async fn send_and_claim(queue: &Queue, clock: &ManualClock, worker: &WorkerId) -> Message {
    let sent = queue.producer().send(NewMessage::new("job", "x")).await;
    assert!(!sent.has_error());
    queue
        .transport()
        .try_claim(worker, &ClaimFilter::default(), clock.now())
        .await
        .unwrap()
        .unwrap()
}

#[test]
fn refresh_interval_divides_dead_time() {
    let config = HeartBeatConfiguration {
        time: Duration::from_secs(40),
        interval: 4,
        ..HeartBeatConfiguration::default()
    };
    assert_eq!(config.refresh_interval(), Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_claim_is_reclaimed_exactly_once() {
    let clock = ManualClock::default();
    let queue = queue_with(&clock, thirty_seconds());
    let message = send_and_claim(&queue, &clock, &WorkerId::from("crashed")).await;

    clock.advance(Duration::from_secs(31));
    let a = queue.heartbeat_monitor();
    let b = queue.heartbeat_monitor();
    let (ra, rb) = tokio::join!(a.reclaim_once(), b.reclaim_once());
    let total = ra.unwrap().len() + rb.unwrap().len();
    assert_eq!(total, 1);

    let stored = queue.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Pending);
    assert!(stored.lock_owner.is_none());

    let again = queue
        .transport()
        .try_claim(&WorkerId::from("healthy"), &ClaimFilter::default(), clock.now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, message.id);
    assert_eq!(again.attempt_count, 2);
}

#[tokio::test]
async fn claim_inside_dead_time_is_left_alone() {
    let clock = ManualClock::default();
    let queue = queue_with(&clock, thirty_seconds());
    send_and_claim(&queue, &clock, &WorkerId::from("slow")).await;

    clock.advance(Duration::from_secs(30));
    assert!(queue.heartbeat_monitor().reclaim_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn refreshed_claim_survives() {
    let clock = ManualClock::default();
    let queue = queue_with(&clock, thirty_seconds());
    let worker = WorkerId::from("busy");
    let message = send_and_claim(&queue, &clock, &worker).await;

    let monitor = queue.heartbeat_monitor();
    let token = CancellationToken::new();
    monitor.claims().register(message.id, worker, token.clone());

    clock.advance(Duration::from_secs(20));
    let (refreshed, lost) = monitor.refresh_once().await;
    assert_eq!(refreshed, 1);
    assert!(lost.is_empty());

    clock.advance(Duration::from_secs(20));
    let pass = monitor.pass().await.unwrap();
    assert_eq!(pass.refreshed, 1);
    assert!(pass.reclaimed.is_empty());
    assert!(!token.is_cancelled());
    assert!(monitor.pool_size() <= 4);
}

#[tokio::test]
async fn lost_claim_cancels_the_handler() {
    let clock = ManualClock::default();
    let queue = queue_with(&clock, thirty_seconds());
    let worker = WorkerId::from("stalled");
    let message = send_and_claim(&queue, &clock, &worker).await;

    let local = queue.heartbeat_monitor();
    let token = CancellationToken::new();
    local.claims().register(message.id, worker, token.clone());

    // Another process reclaims before our next refresh.
    clock.advance(Duration::from_secs(31));
    let remote = queue.heartbeat_monitor();
    assert_eq!(remote.reclaim_once().await.unwrap(), vec![message.id]);

    let (refreshed, lost) = local.refresh_once().await;
    assert_eq!(refreshed, 0);
    assert_eq!(lost, vec![message.id]);
    assert!(token.is_cancelled());
    assert!(local.claims().is_empty());
}

#[tokio::test]
async fn reclaiming_a_local_claim_revokes_it() {
    let clock = ManualClock::default();
    let queue = queue_with(&clock, thirty_seconds());
    let worker = WorkerId::from("frozen");
    let message = send_and_claim(&queue, &clock, &worker).await;

    let monitor = queue.heartbeat_monitor();
    let token = CancellationToken::new();
    monitor.claims().register(message.id, worker, token.clone());

    clock.advance(Duration::from_secs(45));
    assert_eq!(monitor.reclaim_once().await.unwrap(), vec![message.id]);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn lookback_bounds_the_reclaim_scan() {
    let clock = ManualClock::default();
    let heartbeat = HeartBeatConfiguration {
        monitor_time: Some(Duration::from_secs(10)),
        ..thirty_seconds()
    };
    let queue = queue_with(&clock, heartbeat);
    let message = send_and_claim(&queue, &clock, &WorkerId::from("ancient")).await;

    clock.advance(Duration::from_secs(100));
    let monitor = queue.heartbeat_monitor();
    assert!(monitor.reclaim_once().await.unwrap().is_empty());
    assert_eq!(
        queue.get(message.id).await.unwrap().unwrap().status,
        Status::Working
    );
}
