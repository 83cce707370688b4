use rs2_bridge::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_test::{assert_pending, assert_ready_eq, task};
use tokio_util::sync::CancellationToken;

#[test]
fn test_handle_round_trip() {
    let handle = CompletionHandle::new();
    assert_eq!(handle.state(), CompletionState::Initial);

    handle.reset(false).unwrap();
    assert_eq!(handle.state(), CompletionState::Pending);
    assert!(!handle.is_completed());

    handle.set_value(7).unwrap();
    assert!(handle.is_completed());
    assert_eq!(handle.get_result(), Ok(7));

    // Reading resets the handle for the next operation
    assert_eq!(handle.state(), CompletionState::Initial);
    handle.reset(false).unwrap();
    handle.set_error(BridgeError::fault("boom")).unwrap();
    assert_eq!(handle.get_result(), Err(BridgeError::Fault("boom".to_string())));
}

#[test]
fn test_protocol_misuse_is_rejected() {
    let handle = CompletionHandle::<u32>::new();

    // Completing before arming
    assert!(handle.set_value(1).unwrap_err().is_misuse());
    // Reading before completion
    handle.reset(false).unwrap();
    assert!(handle.get_result().unwrap_err().is_misuse());
    // Arming twice
    assert!(handle.reset(false).unwrap_err().is_misuse());

    handle.set_value(1).unwrap();
    // Completing twice
    assert!(matches!(
        handle.set_value(2),
        Err(BridgeError::Misuse("handle completed twice"))
    ));
    // The first result survives the rejected second completion
    assert_eq!(handle.get_result(), Ok(1));
}

#[test]
fn test_on_completed_runs_once() {
    let handle = CompletionHandle::<()>::new();
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(handle.on_completed(|| {}).unwrap_err().is_misuse());

    handle.reset(false).unwrap();
    let counter = calls.clone();
    handle
        .on_completed(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(matches!(
        handle.on_completed(|| {}),
        Err(BridgeError::Misuse("continuation already registered"))
    ));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    handle.set_value(()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.get_result(), Ok(()));
}

#[test]
fn test_on_completed_after_completion_runs_immediately() {
    let handle = CompletionHandle::new();
    handle.reset(false).unwrap();
    handle.set_value(3).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handle
        .on_completed(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.get_result(), Ok(3));
}

#[test]
fn test_panicking_continuation_does_not_poison_handle() {
    let handle = CompletionHandle::new();
    handle.reset(false).unwrap();
    handle.on_completed(|| panic!("continuation failure")).unwrap();

    // The completing side is unaffected by the panic
    assert!(handle.set_value("done").is_ok());
    assert_eq!(handle.get_result(), Ok("done"));
}

#[tokio::test]
async fn test_wait_across_tasks() {
    let handle = Arc::new(CompletionHandle::new());
    handle.reset(false).unwrap();

    let completer = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        completer.set_value(42u64).unwrap();
    });

    assert_eq!(handle.wait().await, Ok(42));
    assert_eq!(handle.state(), CompletionState::Initial);
}

#[test]
fn test_wait_future_registers_waker() {
    let handle = CompletionHandle::new();
    handle.reset(false).unwrap();

    let mut waiting = task::spawn(handle.wait());
    assert_pending!(waiting.poll());
    // Re-polling keeps a single registration
    assert_pending!(waiting.poll());

    handle.set_value(9).unwrap();
    assert!(waiting.is_woken());
    assert_ready_eq!(waiting.poll(), Ok(9));
}

#[test]
fn test_blocking_get_result_from_plain_thread() {
    let handle = Arc::new(CompletionHandle::new());
    handle.reset(false).unwrap();

    let waiter = {
        let handle = handle.clone();
        thread::spawn(move || handle.blocking_get_result())
    };

    thread::sleep(Duration::from_millis(20));
    handle.set_value(String::from("hello")).unwrap();

    assert_eq!(waiter.join().unwrap(), Ok(String::from("hello")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_captured_context_runs_callback_on_runtime() {
    let handle = Arc::new(CompletionHandle::new());
    handle.reset(true).unwrap();

    let (tx, rx) = oneshot::channel();
    handle
        .on_completed(move || {
            let on_runtime = tokio::runtime::Handle::try_current().is_ok();
            let _ = tx.send(on_runtime);
        })
        .unwrap();

    // Complete from a thread that has no runtime of its own
    let completer = handle.clone();
    thread::spawn(move || completer.set_value(1).unwrap())
        .join()
        .unwrap();

    assert_eq!(rx.await, Ok(true));
    assert_eq!(handle.get_result(), Ok(1));
}

#[test]
fn test_pool_reuses_handles_and_rejects_stale_keys() {
    let pool = HandlePool::<i32>::with_capacity(4);

    let first = pool.rent();
    let handle = pool.get(first).unwrap();
    handle.reset(false).unwrap();
    handle.set_value(5).unwrap();
    assert_eq!(pool.rented(), 1);

    assert_eq!(pool.take_result(first), Ok(5));
    assert_eq!(pool.rented(), 0);
    assert_eq!(pool.available(), 1);

    // The returned handle is retired; its old key is stale
    assert_eq!(handle.state(), CompletionState::Final);
    assert!(matches!(pool.get(first), Err(BridgeError::StaleHandle)));
    assert!(matches!(pool.give_back(first), Err(BridgeError::StaleHandle)));
    assert!(matches!(handle.reset(false), Err(BridgeError::StaleHandle)));

    // Renting again reuses the slot under a fresh generation
    let second = pool.rent();
    assert_eq!(second.index(), first.index());
    assert_ne!(second, first);
    assert_eq!(pool.get(second).unwrap().state(), CompletionState::Initial);
}

#[test]
fn test_pool_refuses_to_retire_outstanding_handle() {
    let pool = HandlePool::<()>::new();
    let key = pool.rent();
    pool.get(key).unwrap().reset(false).unwrap();

    assert!(pool.give_back(key).unwrap_err().is_misuse());
    assert_eq!(pool.rented(), 1);
}

#[test]
fn test_aggregator_first_error_wins() {
    let aggregator = ErrorAggregator::default();
    assert!(!aggregator.has_error());
    assert_eq!(aggregator.throw_if_error(), Ok(()));

    assert!(aggregator.set_internal_error(BridgeError::fault("first")));
    assert!(!aggregator.set_internal_error(BridgeError::fault("second")));
    assert!(aggregator.is_cancelled());
    assert_eq!(aggregator.error(), Some(BridgeError::Fault("first".to_string())));
}

#[test]
fn test_aggregator_external_beats_internal() {
    let aggregator = ErrorAggregator::default();
    aggregator.set_internal_error(BridgeError::fault("worker"));
    aggregator.set_external_error(BridgeError::Disposed);

    assert_eq!(aggregator.throw_if_error(), Err(BridgeError::Disposed));
}

#[test]
fn test_aggregator_ignores_cancellation_echo() {
    let aggregator = ErrorAggregator::default();
    aggregator.record_exit(&Err(BridgeError::fault("root cause")));
    // Sibling workers exit with the cancellation we triggered
    aggregator.record_exit(&Err(BridgeError::Cancelled));
    aggregator.record_exit(&Ok(()));

    assert_eq!(aggregator.error(), Some(BridgeError::Fault("root cause".to_string())));
}

#[test]
fn test_aggregator_follows_outside_token() {
    let outside = CancellationToken::new();
    let aggregator = ErrorAggregator::new(Some(outside.clone()));
    let token = aggregator.token();
    assert!(!token.is_cancelled());

    outside.cancel();
    assert!(token.is_cancelled());
    assert!(aggregator.has_error());
    assert_eq!(aggregator.error(), Some(BridgeError::Cancelled));

    // A worker fault after outside cancellation does not displace it
    aggregator.record_exit(&Err(BridgeError::fault("late")));
    assert_eq!(aggregator.throw_if_error(), Err(BridgeError::Cancelled));
}

#[test]
fn test_state_lock_serializes_threads() {
    let lock = Arc::new(StateLock::new(0, Vec::new()));
    let workers: Vec<_> = (0..4)
        .map(|id| {
            let lock = lock.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    let mut guard = lock.lock();
                    guard.push(id * 1000 + i);
                    let next = guard.state() + 1;
                    guard.set_state(next);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let guard = lock.lock();
    assert_eq!(guard.state(), 4000);
    assert_eq!(guard.len(), 4000);
}
