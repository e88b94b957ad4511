//! Retry and fault-injection behavior of transport policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use workq::config::PolicyConfiguration;
use workq::error::{Error, Result};
use workq::policy::{ChaosPolicy, PolicyKey, PolicyRegistry, RetryPolicy, TransportPolicy};

fn fast_retry(retry_count: u32) -> RetryPolicy {
    RetryPolicy::new(retry_count, Duration::from_millis(1), Duration::from_millis(2))
}

/// An operation that fails transiently `failures` times, then succeeds.
fn flaky(calls: &Arc<AtomicU32>, failures: u32) -> impl FnMut() -> std::future::Ready<Result<u32>> {
    let calls = calls.clone();
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(if n < failures {
            Err(Error::Transient(format!("fault {n}")))
        } else {
            Ok(n)
        })
    }
}

#[tokio::test]
async fn recovers_when_faults_stay_below_the_limit() {
    let policy = TransportPolicy::new("command-retry", fast_retry(3));
    let calls = Arc::new(AtomicU32::new(0));

    let value = policy
        .execute(&CancellationToken::new(), flaky(&calls, 2))
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_with_one_exhausted_error() {
    let policy = TransportPolicy::new("command-retry", fast_retry(3));
    let calls = Arc::new(AtomicU32::new(0));

    let err = policy
        .execute(&CancellationToken::new(), flaky(&calls, 10))
        .await
        .unwrap_err();
    match err {
        Error::RetriesExhausted {
            policy,
            attempts,
            source,
        } => {
            assert_eq!(policy, "command-retry");
            assert_eq!(attempts, 4);
            assert!(matches!(*source, Error::Transient(_)));
        }
        other => panic!("expected RetriesExhausted, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let policy = TransportPolicy::new("command-retry", fast_retry(3));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let err = policy
        .execute(&CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Validation("bad".into())) }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn custom_classifier_decides_what_is_retried() {
    let retry = fast_retry(2).classifier(Arc::new(|e: &Error| matches!(e, Error::Other(_))));
    let policy = TransportPolicy::new("query-retry", retry);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let value = policy
        .execute(&CancellationToken::new(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Other("retry me".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(value, 1);
}

#[tokio::test]
async fn cancellation_during_wait_returns_last_error() {
    let retry = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
    let policy = TransportPolicy::new("command-retry", retry);
    let calls = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = policy.execute(&cancel, flaky(&calls, 10)).await.unwrap_err();
    assert!(matches!(err, Error::Transient(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_chaos_never_injects() {
    let policy = TransportPolicy::new("command-retry", fast_retry(3))
        .with_chaos(ChaosPolicy::seeded(false, 1.0, 7));
    let calls = Arc::new(AtomicU32::new(0));

    policy
        .execute(&CancellationToken::new(), flaky(&calls, 0))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn full_rate_chaos_still_lets_the_last_attempt_through() {
    let policy = TransportPolicy::new("command-retry", fast_retry(3))
        .with_chaos(ChaosPolicy::seeded(true, 1.0, 7));
    let calls = Arc::new(AtomicU32::new(0));

    let value = policy
        .execute(&CancellationToken::new(), flaky(&calls, 0))
        .await
        .unwrap();
    assert_eq!(value, 0);
    // Every attempt before the last was replaced by an injected fault.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn blocking_execution_follows_the_same_bounds() {
    let policy = TransportPolicy::new("command-retry", fast_retry(1));
    let mut calls = 0;

    let err = policy
        .execute_blocking(|| {
            calls += 1;
            Err::<(), _>(Error::Transient("down".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(calls, 2);
}

#[test]
fn registry_built_from_configuration_has_both_policies() {
    let config = PolicyConfiguration {
        retry_count: 5,
        enable_chaos: true,
        chaos_injection_rate: 0.5,
        ..PolicyConfiguration::default()
    };
    let registry = PolicyRegistry::from_configuration(&config);

    let command = registry.get(PolicyKey::COMMAND).unwrap();
    assert_eq!(command.retry().max_attempts(), 6);
    assert!(command.chaos().is_some_and(|c| c.is_enabled()));
    assert!(registry.get(PolicyKey::QUERY).is_ok());
    assert!(matches!(
        registry.get(PolicyKey::custom("missing")),
        Err(Error::Config(_))
    ));
}
