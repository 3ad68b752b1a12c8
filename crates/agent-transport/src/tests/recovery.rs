//! Single-flight recovery after an out-of-band failure signal.

use super::harness::{
    envelope, wait_for, InstantSleeper, RecordingSendListener, RecordingStateListener,
    ScriptedTransport, Step,
};
use crate::queue::{InMemoryMessageQueue, MessageQueue};
use crate::{RetryingStateNotifier, TransportError, TransportState};
use std::sync::Arc;
use std::time::Duration;

fn queue_with(payloads: &[&str]) -> Arc<InMemoryMessageQueue> {
    let queue = Arc::new(InMemoryMessageQueue::new(10_000));
    for payload in payloads {
        queue.add(envelope(payload)).unwrap();
    }
    queue
}

/// Three signals while a recovery is running start one recovery and yield
/// one alive notification.
#[tokio::test]
async fn repeated_signals_coalesce_into_one_recovery() {
    let queue = queue_with(&["first", "second", "third"]);
    let transport = ScriptedTransport::with_script(vec![Step::Fail, Step::Fail, Step::Fail], Step::Succeed);
    let states = RecordingStateListener::new();
    let sent = RecordingSendListener::new();

    let notifier = RetryingStateNotifier::new(queue.clone(), transport.clone(), Duration::from_millis(20));
    notifier.add_state_listener(states.clone());
    notifier.add_sending_listener(sent.clone());

    notifier.on_state_failed().unwrap();
    notifier.on_state_failed().unwrap();
    notifier.on_state_failed().unwrap();
    assert!(notifier.is_retrying());

    assert!(wait_for(Duration::from_secs(5), || states.alive_count() == 1).await);
    assert!(!notifier.is_retrying());
    assert_eq!(notifier.state(), TransportState::Alive);
    assert_eq!(states.failed_count(), 1);

    // Only the oldest entry was used as the probe, resent until accepted.
    assert_eq!(transport.attempt_count(), 4);
    assert!(transport
        .attempted_payloads()
        .iter()
        .all(|p| p.as_slice() == b"first"));
    assert_eq!(sent.sent_payloads(), vec![b"first".to_vec()]);
    assert_eq!(queue.size(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(states.alive_count(), 1);
}

/// Concurrent signals from many tasks still produce a single recovery.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_signals_start_one_recovery() {
    let queue = queue_with(&["a", "b", "c", "d"]);
    let transport = ScriptedTransport::with_script(vec![Step::Fail; 5], Step::Succeed);
    let states = RecordingStateListener::new();

    let notifier = Arc::new(
        RetryingStateNotifier::new(queue.clone(), transport.clone(), Duration::from_millis(10)),
    );
    notifier.add_state_listener(states.clone());

    let signals: Vec<_> = (0..16)
        .map(|_| {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.on_state_failed() })
        })
        .collect();
    for signal in signals {
        signal.await.unwrap().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || states.alive_count() == 1).await);
    assert_eq!(states.failed_count(), 1);
    assert_eq!(queue.size(), 3);
    assert_eq!(transport.attempt_count(), 6);
}

/// Once a recovery finished, the next signal starts a fresh one.
#[tokio::test]
async fn signal_after_recovery_rearms() {
    let queue = queue_with(&["one", "two"]);
    let transport = ScriptedTransport::new(Step::Succeed);
    let states = RecordingStateListener::new();

    let notifier = RetryingStateNotifier::new(queue.clone(), transport.clone(), Duration::from_millis(500))
        .with_sleeper(InstantSleeper::new());
    notifier.add_state_listener(states.clone());

    notifier.on_state_failed().unwrap();
    assert!(wait_for(Duration::from_secs(2), || states.alive_count() == 1).await);

    notifier.on_state_failed().unwrap();
    assert!(wait_for(Duration::from_secs(2), || states.alive_count() == 2).await);

    assert_eq!(states.failed_count(), 2);
    assert!(queue.is_empty());
    assert_eq!(
        transport.attempted_payloads(),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
}

/// Unsuccessful responses are not treated as recovery.
#[tokio::test]
async fn rejected_probe_keeps_retrying_at_fixed_interval() {
    let queue = queue_with(&["probe"]);
    let transport = ScriptedTransport::with_script(vec![Step::Reject, Step::Reject, Step::Fail], Step::Succeed);
    let states = RecordingStateListener::new();
    let sleeper = InstantSleeper::new();

    let notifier = RetryingStateNotifier::new(queue, transport.clone(), Duration::from_millis(500))
        .with_sleeper(sleeper.clone());
    notifier.add_state_listener(states.clone());

    notifier.on_state_failed().unwrap();
    assert!(wait_for(Duration::from_secs(2), || states.alive_count() == 1).await);

    assert_eq!(transport.attempt_count(), 4);
    assert_eq!(sleeper.delays(), vec![Duration::from_millis(500); 3]);
}

/// A failure signal with nothing queued is a caller error.
#[tokio::test]
async fn signal_on_empty_queue_propagates_error() {
    let notifier = RetryingStateNotifier::new(
        queue_with(&[]),
        ScriptedTransport::new(Step::Succeed),
        Duration::from_millis(500),
    );
    let states = RecordingStateListener::new();
    notifier.add_state_listener(states.clone());

    assert!(matches!(
        notifier.on_state_failed(),
        Err(TransportError::EmptyQueue)
    ));
    assert_eq!(states.failed_count(), 0);
    assert!(!notifier.is_retrying());
}

/// Shutting down mid-recovery reports the probe unsent and never announces
/// alive.
#[tokio::test]
async fn shutdown_reports_probe_unsent() {
    let queue = queue_with(&["probe"]);
    let transport = ScriptedTransport::new(Step::Fail);
    let states = RecordingStateListener::new();
    let sent = RecordingSendListener::new();

    let notifier = RetryingStateNotifier::new(queue, transport.clone(), Duration::from_millis(20));
    notifier.add_state_listener(states.clone());
    notifier.add_sending_listener(sent.clone());

    notifier.on_state_failed().unwrap();
    assert!(wait_for(Duration::from_secs(2), || transport.attempt_count() >= 3).await);

    notifier.shutdown().await;

    assert_eq!(states.alive_count(), 0);
    assert_eq!(sent.unsent_count(), 1);
    assert_eq!(sent.sent_count(), 0);
    assert!(!notifier.is_retrying());

    // Signals after shutdown are ignored.
    notifier.on_state_failed().unwrap();
    assert!(!notifier.is_retrying());
}

/// Shutdown stops the recovery loop promptly even when the timer never blocks.
#[tokio::test]
async fn shutdown_cancels_recovery_with_injected_sleeper() {
    let queue = queue_with(&["oldest"]);
    let transport = ScriptedTransport::new(Step::Fail);
    let states = RecordingStateListener::new();
    let sent = RecordingSendListener::new();

    let notifier = RetryingStateNotifier::new(queue, transport.clone(), Duration::from_millis(500))
        .with_sleeper(InstantSleeper::new());
    notifier.add_state_listener(states.clone());
    notifier.add_sending_listener(sent.clone());

    notifier.on_state_failed().unwrap();
    assert!(wait_for(Duration::from_secs(2), || transport.attempt_count() >= 10).await);

    let started = tokio::time::Instant::now();
    notifier.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(sent.unsent_count(), 1);
    assert_eq!(states.alive_count(), 0);
    assert!(!notifier.is_retrying());
}

/// Signals racing recoveries never reorder notifications: listeners see
/// strictly alternating failed and alive events.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_alternate_under_racing_signals() {
    let payloads: Vec<String> = (0..1000).map(|i| format!("m{i}")).collect();
    let queue = Arc::new(InMemoryMessageQueue::new(1_000_000));
    for payload in &payloads {
        queue.add(envelope(payload)).unwrap();
    }
    let transport = ScriptedTransport::new(Step::Succeed);
    let states = RecordingStateListener::new();

    let notifier = Arc::new(
        RetryingStateNotifier::new(queue, transport, Duration::from_millis(500))
            .with_sleeper(InstantSleeper::new()),
    );
    notifier.add_state_listener(states.clone());

    let signals: Vec<_> = (0..4)
        .map(|_| {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    notifier.on_state_failed().unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for signal in signals {
        signal.await.unwrap();
    }

    assert!(
        wait_for(Duration::from_secs(5), || {
            !notifier.is_retrying() && states.alive_count() == states.failed_count()
        })
        .await
    );

    let events = states.events();
    assert!(!events.is_empty());
    for (i, event) in events.iter().enumerate() {
        let expected = if i % 2 == 0 {
            TransportState::Failed
        } else {
            TransportState::Alive
        };
        assert_eq!(*event, expected, "event {i} out of order in {events:?}");
    }
}
