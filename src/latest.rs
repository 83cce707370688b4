//! Lossy single-producer bridge that keeps only the newest value.
//!
//! The producer never suspends: [`Publisher::publish`] either hands the value
//! to a waiting consumer or overwrites the pending slot. A consumer that is
//! slower than its producer therefore sees a subsequence of the values, always
//! ending with the newest one, and memory stays constant.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ErrorAggregator;
use crate::completion::{CompletionHandle, CompletionState};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::pull::{box_producer, AsyncPull, BoxedProducer, BridgeStats};
use crate::state_word::StateLock;

const INITIAL: i32 = 0;
const ACCEPTING: i32 = 1;
const IDLE: i32 = 2;
const COMPLETED: i32 = 3;
const FINAL: i32 = 4;
const CANCELING: i32 = 5;

struct Snapshot<T> {
    next: Option<T>,
    terminal: Option<BridgeResult<()>>,
    disposed: bool,
    delivered: u64,
    dropped: u64,
}

struct Shared<T> {
    snapshot: StateLock<Snapshot<T>>,
    pull: CompletionHandle<Option<T>>,
    capture_context: bool,
    aggregator: ErrorAggregator,
}

impl<T> Shared<T> {
    fn producer_finished(&self, result: BridgeResult<()>) {
        self.aggregator.record_exit(&result);
        let terminal = self.aggregator.throw_if_error();
        let wake_pull = {
            let mut snapshot = self.snapshot.lock();
            match snapshot.state() {
                ACCEPTING => {
                    snapshot.set_state(FINAL);
                    true
                }
                IDLE => {
                    snapshot.set_state(COMPLETED);
                    snapshot.terminal = Some(terminal.clone());
                    false
                }
                _ => {
                    snapshot.set_state(FINAL);
                    false
                }
            }
        };
        log::debug!("latest bridge: producer finished ({:?})", terminal);
        if wake_pull {
            let _ = self.pull.set_result(terminal.map(|_| None));
        }
    }
}

/// Producer-side handle of a [`LatestSnapshotBridge`].
pub struct Publisher<T> {
    shared: Arc<Shared<T>>,
    token: CancellationToken,
}

impl<T> Publisher<T> {
    /// Publish a value, replacing any value the consumer has not taken yet.
    /// Never suspends.
    pub fn publish(&mut self, value: T) -> BridgeResult<()> {
        let shared = &self.shared;
        {
            let mut snapshot = shared.snapshot.lock();
            match snapshot.state() {
                ACCEPTING => {
                    snapshot.set_state(IDLE);
                    snapshot.delivered += 1;
                }
                IDLE => {
                    if snapshot.next.replace(value).is_some() {
                        snapshot.dropped += 1;
                    }
                    return Ok(());
                }
                CANCELING => return Err(BridgeError::Disposed),
                _ if snapshot.disposed => return Err(BridgeError::Disposed),
                INITIAL => return Err(BridgeError::Misuse("publish before the bridge started")),
                _ => return Err(BridgeError::Misuse("publish after the producer completed")),
            }
        }
        shared.pull.set_value(Some(value))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Pull-based view of the newest value a background producer published.
pub struct LatestSnapshotBridge<T> {
    shared: Arc<Shared<T>>,
    producer: Option<BoxedProducer<Publisher<T>>>,
    task: Option<JoinHandle<()>>,
    current: Option<T>,
    finished: bool,
    disposed: bool,
}

impl<T: Send + 'static> LatestSnapshotBridge<T> {
    /// Create a bridge around `producer`, spawned on the first pull. Only
    /// `capture_context` and `cancellation` of the config apply.
    pub fn new<F, Fut>(config: BridgeConfig, producer: F) -> Self
    where
        F: FnOnce(Publisher<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                snapshot: StateLock::new(
                    INITIAL,
                    Snapshot {
                        next: None,
                        terminal: None,
                        disposed: false,
                        delivered: 0,
                        dropped: 0,
                    },
                ),
                pull: CompletionHandle::new(),
                capture_context: config.capture_context,
                aggregator: ErrorAggregator::new(config.cancellation),
            }),
            producer: Some(box_producer(producer)),
            task: None,
            current: None,
            finished: false,
            disposed: false,
        }
    }

    pub fn stats(&self) -> BridgeStats {
        let snapshot = self.shared.snapshot.lock();
        BridgeStats {
            queued: usize::from(snapshot.next.is_some()),
            bound: Some(1),
            producer_suspended: false,
            delivered: snapshot.delivered,
            dropped: snapshot.dropped,
            peak_queued: 1,
        }
    }

    fn start(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        let shared = self.shared.clone();
        let token = shared.aggregator.token();
        let publisher = Publisher {
            shared: shared.clone(),
            token: token.clone(),
        };
        log::debug!("latest bridge: starting producer");
        self.task = Some(tokio::spawn(async move {
            let result = producer(publisher, token).await;
            shared.producer_finished(result);
        }));
    }

    async fn await_pull(&mut self) -> BridgeResult<bool> {
        let shared = self.shared.clone();
        let token = shared.aggregator.token();
        let outcome = tokio::select! {
            biased;
            result = shared.pull.wait() => result,
            _ = token.cancelled() => Err(shared
                .aggregator
                .error()
                .unwrap_or(BridgeError::Cancelled)),
        };
        match outcome {
            Ok(Some(value)) => {
                self.current = Some(value);
                Ok(true)
            }
            Ok(None) => {
                self.finished = true;
                Ok(false)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> BridgeResult<bool> {
        self.current = None;
        if self.finished {
            return Ok(false);
        }
        if self.shared.pull.state() != CompletionState::Initial {
            return self.await_pull().await;
        }

        enum Step<T> {
            Start,
            Wait,
            Value(T),
            Finish(BridgeResult<()>),
        }

        let step = {
            let shared = &self.shared;
            let mut snapshot = shared.snapshot.lock();
            match snapshot.state() {
                INITIAL => {
                    shared.pull.reset(shared.capture_context)?;
                    snapshot.set_state(ACCEPTING);
                    Step::Start
                }
                IDLE => match snapshot.next.take() {
                    Some(value) => {
                        snapshot.delivered += 1;
                        Step::Value(value)
                    }
                    None => {
                        shared.pull.reset(shared.capture_context)?;
                        snapshot.set_state(ACCEPTING);
                        Step::Wait
                    }
                },
                COMPLETED => match snapshot.next.take() {
                    Some(value) => {
                        snapshot.delivered += 1;
                        Step::Value(value)
                    }
                    None => {
                        snapshot.set_state(FINAL);
                        Step::Finish(snapshot.terminal.take().unwrap_or(Ok(())))
                    }
                },
                ACCEPTING => return Err(BridgeError::Misuse("overlapping pulls")),
                CANCELING => return Err(BridgeError::Disposed),
                _ => Step::Finish(Ok(())),
            }
        };

        match step {
            Step::Start => {
                self.start();
                self.await_pull().await
            }
            Step::Wait => self.await_pull().await,
            Step::Value(value) => {
                self.current = Some(value);
                Ok(true)
            }
            Step::Finish(result) => {
                self.finished = true;
                result.map(|_| false)
            }
        }
    }

    fn begin_dispose(&mut self) {
        self.disposed = true;
        self.finished = true;
        self.current = None;
        let shared = &self.shared;
        shared.aggregator.set_external_error(BridgeError::Disposed);
        let release_pull = {
            let mut snapshot = shared.snapshot.lock();
            snapshot.disposed = true;
            snapshot.next = None;
            match snapshot.state() {
                ACCEPTING => {
                    snapshot.set_state(CANCELING);
                    true
                }
                IDLE => {
                    snapshot.set_state(CANCELING);
                    false
                }
                INITIAL | COMPLETED => {
                    snapshot.set_state(FINAL);
                    false
                }
                _ => false,
            }
        };
        if release_pull {
            let _ = shared.pull.set_error(BridgeError::Disposed);
        }
        if shared.pull.is_completed() {
            let _ = shared.pull.get_result();
        }
        self.producer = None;
    }
}

#[async_trait]
impl<T: Send + 'static> AsyncPull for LatestSnapshotBridge<T> {
    type Item = T;

    async fn try_advance(&mut self) -> BridgeResult<bool> {
        self.advance().await
    }

    fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<T> {
        self.current.take()
    }

    async fn dispose(&mut self) {
        if !self.disposed {
            self.begin_dispose();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("latest bridge: producer task failed: {}", e);
            }
        }
        let mut snapshot = self.shared.snapshot.lock();
        snapshot.set_state(FINAL);
    }
}

impl<T> Drop for LatestSnapshotBridge<T> {
    fn drop(&mut self) {
        if self.disposed || self.task.is_none() {
            return;
        }
        log::debug!("latest bridge dropped without dispose; cancelling producer");
        self.shared.aggregator.set_external_error(BridgeError::Disposed);
        let mut snapshot = self.shared.snapshot.lock();
        snapshot.disposed = true;
        snapshot.next = None;
    }
}

/// Follow a stream through a [`LatestSnapshotBridge`], keeping only the
/// newest item the consumer has not taken.
pub fn latest<S>(stream: S, config: BridgeConfig) -> LatestSnapshotBridge<S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    LatestSnapshotBridge::new(config, move |publisher, token| {
        follow(stream.map(Ok), publisher, token)
    })
}

/// Like [`latest`], for streams whose errors should terminate the bridge.
/// A value published before the error is still delivered first.
pub fn try_latest<S, T>(stream: S, config: BridgeConfig) -> LatestSnapshotBridge<T>
where
    S: Stream<Item = BridgeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    LatestSnapshotBridge::new(config, move |publisher, token| follow(stream, publisher, token))
}

async fn follow<S, T>(stream: S, mut publisher: Publisher<T>, token: CancellationToken) -> BridgeResult<()>
where
    S: Stream<Item = BridgeResult<T>>,
{
    pin_mut!(stream);
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(item)) => publisher.publish(item)?,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
