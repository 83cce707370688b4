use futures_util::stream::{self, StreamExt};
use rs2_bridge::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

async fn drain<P: AsyncPull>(puller: &mut P) -> BridgeResult<Vec<P::Item>> {
    let mut items = Vec::new();
    while puller.try_advance().await? {
        items.extend(puller.take_current());
    }
    Ok(items)
}

#[tokio::test]
async fn test_zip_pairs_in_lock_step_and_stops_at_shortest() {
    let mut zipped = zip_all(
        vec![
            stream::iter(vec!["a1", "a2", "a3"]),
            stream::iter(vec!["b1", "b2"]),
        ],
        |parts| parts.concat(),
    );
    assert_eq!(zipped.width(), 2);
    assert_eq!(zipped.state(), RendezvousState::Initial);

    assert_eq!(drain(&mut zipped).await, Ok(vec!["a1b1".to_string(), "a2b2".to_string()]));
    assert_eq!(zipped.try_advance().await, Ok(false));

    zipped.dispose().await;
    assert_eq!(zipped.active_workers(), 0);
    assert_eq!(zipped.state(), RendezvousState::Final);
}

#[tokio::test]
async fn test_zip_three_sources_with_uneven_pace() {
    let slow = stream::iter(0..4).then(|i| async move {
        sleep(Duration::from_millis(3)).await;
        i
    });
    let sources = vec![
        stream::iter(0..10).boxed(),
        slow.boxed(),
        stream::iter(100..105).boxed(),
    ];
    let mut zipped = zip_all(sources, |values: Vec<i32>| (values[0], values[1], values[2]));

    assert_eq!(
        drain(&mut zipped).await.unwrap(),
        vec![(0, 0, 100), (1, 1, 101), (2, 2, 102), (3, 3, 103)]
    );
    zipped.dispose().await;
}

#[tokio::test]
async fn test_zip_over_no_sources_is_empty() {
    let mut zipped = zip_all(Vec::<stream::Iter<std::vec::IntoIter<u8>>>::new(), |values| values.len());
    assert_eq!(zipped.try_advance().await, Ok(false));
    zipped.dispose().await;
}

#[tokio::test]
async fn test_source_error_terminates_zip() {
    let sources = vec![
        stream::iter(vec![Ok(1), Err(BridgeError::fault("left failed")), Ok(3)]),
        stream::iter(vec![Ok(10), Ok(20), Ok(30)]),
    ];
    let mut zipped = try_zip_all(sources, CombineConfig::zip(), |values: Vec<i32>| {
        Ok(values.iter().sum::<i32>())
    });

    assert_eq!(zipped.next_item().await, Some(Ok(11)));
    assert_eq!(
        zipped.next_item().await,
        Some(Err(BridgeError::Fault("left failed".to_string())))
    );
    // Exactly one error is surfaced
    assert_eq!(zipped.next_item().await, None);
    zipped.dispose().await;
}

#[tokio::test]
async fn test_combining_function_error_terminates_zip() {
    let sources = vec![
        stream::iter(vec![Ok(1), Ok(8), Ok(1)]),
        stream::iter(vec![Ok(2), Ok(9), Ok(2)]),
    ];
    let zipped = try_zip_all(sources, CombineConfig::zip(), |values: Vec<u32>| {
        let sum: u32 = values.iter().sum();
        if sum > 10 {
            Err(BridgeError::fault(format!("sum {} too large", sum)))
        } else {
            Ok(sum)
        }
    });

    let collected: Vec<_> = into_stream(zipped).collect().await;
    assert_eq!(
        collected,
        vec![Ok(3), Err(BridgeError::Fault("sum 17 too large".to_string()))]
    );
}

#[tokio::test]
async fn test_outside_cancellation_stops_workers() {
    let outside = CancellationToken::new();
    let sources = vec![
        stream::pending::<BridgeResult<i32>>(),
        stream::pending::<BridgeResult<i32>>(),
    ];
    let config = CombineConfig::zip().cancellation(outside.clone());
    let mut zipped = try_zip_all(sources, config, |values: Vec<i32>| Ok(values.len()));

    let trigger = outside.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let outcome = timeout(Duration::from_secs(2), zipped.try_advance()).await;
    assert_eq!(outcome, Ok(Err(BridgeError::Cancelled)));
    assert_eq!(zipped.active_workers(), 0);
    zipped.dispose().await;
}

#[tokio::test]
async fn test_dispose_drains_infinite_sources() {
    let mut zipped = zip_all(vec![stream::iter(0u64..), stream::iter(0u64..)], |values| {
        values.iter().sum::<u64>()
    });

    for expected in [0, 2, 4] {
        assert_eq!(zipped.try_advance().await, Ok(true));
        assert_eq!(zipped.current(), Some(&expected));
    }

    timeout(Duration::from_secs(2), zipped.dispose())
        .await
        .expect("dispose should not hang");
    assert_eq!(zipped.active_workers(), 0);
    assert_eq!(zipped.try_advance().await, Ok(false));
}

#[tokio::test]
async fn test_combine_latest_releases_on_every_arrival() {
    let (tx_a, rx_a) = mpsc::channel(4);
    let (tx_b, rx_b) = mpsc::channel(4);
    let mut combined = combine_latest(
        vec![ReceiverStream::new(rx_a), ReceiverStream::new(rx_b)],
        |values: Vec<i32>| values[0] * 100 + values[1],
    );

    tx_a.send(1).await.unwrap();
    tx_b.send(10).await.unwrap();
    assert_eq!(combined.next_item().await, Some(Ok(110)));

    // Only one side moves; the other keeps its newest value
    tx_a.send(2).await.unwrap();
    assert_eq!(combined.next_item().await, Some(Ok(210)));

    tx_b.send(20).await.unwrap();
    assert_eq!(combined.next_item().await, Some(Ok(220)));

    // Both sides ending cleanly ends the combination
    drop(tx_a);
    drop(tx_b);
    assert_eq!(combined.next_item().await, None);
    combined.dispose().await;
}

#[tokio::test]
async fn test_combine_latest_ends_when_a_source_never_produces() {
    let (tx, rx) = mpsc::channel::<i32>(1);
    let (silent_tx, silent) = mpsc::channel::<i32>(1);
    drop(silent_tx);
    let mut combined = combine_latest(
        vec![ReceiverStream::new(rx), ReceiverStream::new(silent)],
        |values: Vec<i32>| values.len(),
    );

    let outcome = timeout(Duration::from_secs(2), combined.try_advance()).await;
    assert_eq!(outcome, Ok(Ok(false)));
    assert_eq!(combined.active_workers(), 0);
    drop(tx);
    combined.dispose().await;
}

#[tokio::test]
async fn test_with_config_selects_release_mode() {
    let sources: Vec<Source<i32>> = vec![
        stream::iter(vec![Ok(1), Ok(2)]).boxed(),
        stream::iter(vec![Ok(3), Ok(4)]).boxed(),
    ];
    let mut zipped = RendezvousCombinator::with_config(sources, CombineConfig::zip(), |values: Vec<i32>| {
        Ok(values)
    });

    assert_eq!(drain(&mut zipped).await, Ok(vec![vec![1, 3], vec![2, 4]]));
    assert_eq!(zipped.dropped(), 0);
    zipped.dispose().await;
}

#[tokio::test]
async fn test_sources_failing_in_same_round_surface_one_error() {
    let sources = vec![
        stream::iter(vec![Ok(1), Err(BridgeError::fault("left"))]),
        stream::iter(vec![Ok(2), Err(BridgeError::fault("right"))]),
    ];
    let mut zipped = try_zip_all(sources, CombineConfig::zip(), |values: Vec<i32>| {
        Ok(values.iter().sum::<i32>())
    });

    assert_eq!(zipped.next_item().await, Some(Ok(3)));
    let error = zipped.try_advance().await.unwrap_err();
    assert!(
        error == BridgeError::fault("left") || error == BridgeError::fault("right"),
        "unexpected error: {:?}",
        error
    );

    // The losing fault is swallowed, not reported later
    assert_eq!(zipped.try_advance().await, Ok(false));
    assert_eq!(zipped.active_workers(), 0);
    zipped.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_combine_latest_never_publishes_older_snapshot() {
    let (tx_a, rx_a) = mpsc::channel(4);
    let (tx_b, rx_b) = mpsc::channel(4);
    let mut combined = combine_latest(
        vec![ReceiverStream::new(rx_a), ReceiverStream::new(rx_b)],
        |values: Vec<i32>| {
            if values == [2, 10] {
                std::thread::sleep(Duration::from_millis(300));
            }
            values[0] * 100 + values[1]
        },
    );

    // Workers start on the first pull; `a` arrives first so that only `b`
    // is held after the first round
    let (first, _) = tokio::join!(combined.next_item(), async {
        tx_a.send(1).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        tx_b.send(10).await.unwrap();
    });
    assert_eq!(first, Some(Ok(110)));

    // (2, 10) is still combining when (2, 20) is published
    tx_a.send(2).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    tx_b.send(20).await.unwrap();
    drop(tx_a);
    drop(tx_b);

    let rest = timeout(Duration::from_secs(2), drain(&mut combined))
        .await
        .expect("combination should end")
        .unwrap();
    assert_eq!(rest, vec![220]);
    assert_eq!(combined.dropped(), 1);
    combined.dispose().await;
}
