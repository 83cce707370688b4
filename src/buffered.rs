//! Single-producer, single-consumer bridge with an optional bounded queue.
//!
//! The producer runs as its own tokio task and pushes items through an
//! [`Emitter`]; the consumer pulls them one at a time. When the consumer is
//! already waiting, an emitted item is handed straight to its pull. When the
//! queue holds `bound` items, [`Emitter::emit`] suspends until the consumer
//! takes one, which is the only backpressure mechanism.
//!
//! # Examples
//! ```
//! use rs2_bridge::*;
//!
//! # async fn example() -> BridgeResult<()> {
//! let mut bridge = BufferedBridge::new(BridgeConfig::bounded(2), |mut emitter, _token| async move {
//!     for i in 0..5 {
//!         emitter.emit(i).await?;
//!     }
//!     Ok::<_, BridgeError>(())
//! });
//!
//! let mut seen = Vec::new();
//! while bridge.try_advance().await? {
//!     seen.extend(bridge.take_current());
//! }
//! assert_eq!(seen, vec![0, 1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ErrorAggregator;
use crate::completion::{CompletionHandle, CompletionState};
use crate::config::{BridgeConfig, QueueBound};
use crate::error::{BridgeError, BridgeResult};
use crate::pull::{box_producer, AsyncPull, BoxedProducer, BridgeStats};
use crate::state_word::StateLock;

const INITIAL: i32 = 0;
const ACCEPTING: i32 = 1;
const EMITTING: i32 = 2;
const COMPLETED: i32 = 3;
const FINAL: i32 = 4;
const CANCELING: i32 = 5;
const CANCELING_PULLING: i32 = 6;

/// Lifecycle of a [`BufferedBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Producer not started yet
    Initial,
    /// Consumer waiting, nothing queued
    Accepting,
    /// Consumer busy; items may be queued
    Emitting,
    /// Producer finished; queued items remain
    Completed,
    /// Drained and torn down
    Final,
    /// Disposal in progress
    Canceling,
    /// Disposal in progress while a pull was outstanding
    CancelingPulling,
}

impl BridgeState {
    fn from_word(word: i32) -> Self {
        match word {
            INITIAL => BridgeState::Initial,
            ACCEPTING => BridgeState::Accepting,
            EMITTING => BridgeState::Emitting,
            COMPLETED => BridgeState::Completed,
            CANCELING => BridgeState::Canceling,
            CANCELING_PULLING => BridgeState::CancelingPulling,
            _ => BridgeState::Final,
        }
    }
}

struct Buffer<T> {
    queue: VecDeque<T>,
    terminal: Option<BridgeResult<()>>,
    producer_waiting: bool,
    disposed: bool,
    delivered: u64,
    peak_queued: usize,
}

struct Shared<T> {
    buffer: StateLock<Buffer<T>>,
    pull: CompletionHandle<Option<T>>,
    push: CompletionHandle<()>,
    bound: QueueBound,
    retained_capacity: usize,
    capture_context: bool,
    aggregator: ErrorAggregator,
}

impl<T> Shared<T> {
    fn producer_finished(&self, result: BridgeResult<()>) {
        self.aggregator.record_exit(&result);
        let terminal = self.aggregator.throw_if_error();

        let wake_pull = {
            let mut buffer = self.buffer.lock();
            match buffer.state() {
                ACCEPTING => {
                    buffer.set_state(FINAL);
                    true
                }
                EMITTING => {
                    buffer.set_state(COMPLETED);
                    buffer.terminal = Some(terminal.clone());
                    false
                }
                CANCELING | CANCELING_PULLING => {
                    buffer.set_state(FINAL);
                    false
                }
                state => {
                    log::warn!("buffered bridge: producer finished in state {:?}", BridgeState::from_word(state));
                    false
                }
            }
        };
        log::debug!("buffered bridge: producer finished ({:?})", terminal);
        if wake_pull {
            let _ = self.pull.set_result(terminal.map(|_| None));
        }
    }

    fn trim(&self, buffer: &mut Buffer<T>) {
        if buffer.queue.is_empty() && buffer.queue.capacity() > self.retained_capacity {
            log::trace!(
                "buffered bridge: trimming queue capacity {} -> {}",
                buffer.queue.capacity(),
                self.retained_capacity
            );
            buffer.queue.shrink_to(self.retained_capacity);
        }
    }
}

/// Producer-side handle of a [`BufferedBridge`].
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
    token: CancellationToken,
}

impl<T> Emitter<T> {
    /// Deliver one item. Suspends while the queue is at its bound. Fails with
    /// [`BridgeError::Disposed`] once the consumer has walked away.
    pub async fn emit(&mut self, item: T) -> BridgeResult<()> {
        let shared = &self.shared;
        if self.token.is_cancelled() {
            return Err(shared.aggregator.error().unwrap_or(BridgeError::Cancelled));
        }
        // A previous emit may have been dropped while suspended.
        match shared.push.state() {
            CompletionState::Completed => shared.push.get_result()?,
            CompletionState::Pending => shared.push.wait().await?,
            _ => {}
        }

        loop {
            let handoff = {
                let mut buffer = shared.buffer.lock();
                match buffer.state() {
                    ACCEPTING => {
                        buffer.set_state(EMITTING);
                        buffer.delivered += 1;
                        true
                    }
                    EMITTING if !shared.bound.is_reached(buffer.queue.len()) => {
                        buffer.queue.push_back(item);
                        buffer.peak_queued = buffer.peak_queued.max(buffer.queue.len());
                        return Ok(());
                    }
                    EMITTING => {
                        shared.push.reset(false)?;
                        buffer.producer_waiting = true;
                        false
                    }
                    CANCELING | CANCELING_PULLING => return Err(BridgeError::Disposed),
                    _ if buffer.disposed => return Err(BridgeError::Disposed),
                    INITIAL => return Err(BridgeError::Misuse("emit before the bridge started")),
                    _ => return Err(BridgeError::Misuse("emit after the producer completed")),
                }
            };
            if handoff {
                return shared.pull.set_value(Some(item));
            }
            tokio::select! {
                biased;
                released = shared.push.wait() => released?,
                _ = self.token.cancelled() => {
                    return Err(shared.aggregator.error().unwrap_or(BridgeError::Cancelled));
                }
            }
        }
    }

    /// The token the producer must observe.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Pull-based view over a background producer.
pub struct BufferedBridge<T> {
    shared: Arc<Shared<T>>,
    producer: Option<BoxedProducer<Emitter<T>>>,
    task: Option<JoinHandle<()>>,
    current: Option<T>,
    finished: bool,
    disposed: bool,
}

enum Pull<T> {
    Start,
    Wait,
    Item(T, bool),
    Finish(BridgeResult<()>),
    End,
}

impl<T: Send + 'static> BufferedBridge<T> {
    /// Create a bridge around `producer`. The producer is spawned on the
    /// first pull, receives an [`Emitter`] and the cancellation token it
    /// must observe, and reports how it terminated.
    ///
    /// Because nothing runs before that first pull, the first emitted item
    /// is always handed straight to the waiting consumer and never queued.
    /// With a bound of `n` the producer therefore parks on its `n + 2`th
    /// push, not its `n + 1`th.
    pub fn new<F, Fut>(config: BridgeConfig, producer: F) -> Self
    where
        F: FnOnce(Emitter<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        let retained = config.retained_capacity;
        let initial_capacity = config.bound.limit().unwrap_or(retained).min(retained);
        let shared = Arc::new(Shared {
            buffer: StateLock::new(
                INITIAL,
                Buffer {
                    queue: VecDeque::with_capacity(initial_capacity),
                    terminal: None,
                    producer_waiting: false,
                    disposed: false,
                    delivered: 0,
                    peak_queued: 0,
                },
            ),
            pull: CompletionHandle::new(),
            push: CompletionHandle::new(),
            bound: config.bound,
            retained_capacity: retained,
            capture_context: config.capture_context,
            aggregator: ErrorAggregator::new(config.cancellation),
        });
        Self {
            shared,
            producer: Some(box_producer(producer)),
            task: None,
            current: None,
            finished: false,
            disposed: false,
        }
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_word(self.shared.buffer.state())
    }

    pub fn stats(&self) -> BridgeStats {
        let buffer = self.shared.buffer.lock();
        BridgeStats {
            queued: buffer.queue.len(),
            bound: self.shared.bound.limit(),
            producer_suspended: buffer.producer_waiting,
            delivered: buffer.delivered,
            dropped: 0,
            peak_queued: buffer.peak_queued,
        }
    }

    fn start(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        let shared = self.shared.clone();
        let token = shared.aggregator.token();
        let emitter = Emitter {
            shared: shared.clone(),
            token: token.clone(),
        };
        log::debug!("buffered bridge: starting producer (bound {:?})", shared.bound);
        self.task = Some(tokio::spawn(async move {
            let result = producer(emitter, token).await;
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
            Ok(Some(item)) => {
                self.current = Some(item);
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
        // A previous pull may have been dropped while waiting.
        if self.shared.pull.state() != CompletionState::Initial {
            return self.await_pull().await;
        }

        let step = {
            let shared = &self.shared;
            let mut buffer = shared.buffer.lock();
            match buffer.state() {
                INITIAL => {
                    shared.pull.reset(shared.capture_context)?;
                    buffer.set_state(ACCEPTING);
                    Pull::Start
                }
                EMITTING => match buffer.queue.pop_front() {
                    Some(item) => {
                        buffer.delivered += 1;
                        shared.trim(&mut buffer);
                        let release = std::mem::take(&mut buffer.producer_waiting);
                        Pull::Item(item, release)
                    }
                    None => {
                        shared.pull.reset(shared.capture_context)?;
                        buffer.set_state(ACCEPTING);
                        Pull::Wait
                    }
                },
                COMPLETED => match buffer.queue.pop_front() {
                    Some(item) => {
                        buffer.delivered += 1;
                        Pull::Item(item, false)
                    }
                    None => {
                        shared.trim(&mut buffer);
                        buffer.set_state(FINAL);
                        Pull::Finish(buffer.terminal.take().unwrap_or(Ok(())))
                    }
                },
                ACCEPTING => return Err(BridgeError::Misuse("overlapping pulls")),
                CANCELING | CANCELING_PULLING => return Err(BridgeError::Disposed),
                _ => Pull::End,
            }
        };

        match step {
            Pull::Start => {
                self.start();
                self.await_pull().await
            }
            Pull::Wait => self.await_pull().await,
            Pull::Item(item, release) => {
                if release {
                    let _ = self.shared.push.set_value(());
                }
                self.current = Some(item);
                Ok(true)
            }
            Pull::Finish(result) => {
                self.finished = true;
                result.map(|_| false)
            }
            Pull::End => {
                self.finished = true;
                Ok(false)
            }
        }
    }

    /// Synchronous part of disposal: cancel, discard, and release waiters.
    fn begin_dispose(&mut self) {
        self.disposed = true;
        self.finished = true;
        self.current = None;
        let shared = &self.shared;
        shared.aggregator.set_external_error(BridgeError::Disposed);

        let (release_push, release_pull) = {
            let mut buffer = shared.buffer.lock();
            buffer.disposed = true;
            let release = match buffer.state() {
                INITIAL => {
                    buffer.set_state(FINAL);
                    (false, false)
                }
                ACCEPTING => {
                    buffer.set_state(CANCELING_PULLING);
                    (false, true)
                }
                EMITTING => {
                    buffer.set_state(CANCELING);
                    (std::mem::take(&mut buffer.producer_waiting), false)
                }
                COMPLETED => {
                    buffer.set_state(FINAL);
                    (false, false)
                }
                _ => (false, false),
            };
            let discarded = buffer.queue.len();
            buffer.queue.clear();
            shared.trim(&mut buffer);
            if discarded > 0 {
                log::debug!("buffered bridge: disposal discarded {} queued items", discarded);
            }
            release
        };

        if release_push {
            let _ = shared.push.set_error(BridgeError::Disposed);
        }
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
impl<T: Send + 'static> AsyncPull for BufferedBridge<T> {
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
                log::warn!("buffered bridge: producer task failed: {}", e);
            }
        }
        let mut buffer = self.shared.buffer.lock();
        buffer.set_state(FINAL);
    }
}

impl<T> Drop for BufferedBridge<T> {
    fn drop(&mut self) {
        if self.disposed || self.task.is_none() {
            return;
        }
        log::debug!("buffered bridge dropped without dispose; cancelling producer");
        let shared = &self.shared;
        shared.aggregator.set_external_error(BridgeError::Disposed);
        let release_push = {
            let mut buffer = shared.buffer.lock();
            buffer.disposed = true;
            buffer.queue.clear();
            if matches!(buffer.state(), ACCEPTING | EMITTING) {
                buffer.set_state(CANCELING);
            }
            std::mem::take(&mut buffer.producer_waiting)
        };
        if release_push {
            let _ = shared.push.set_error(BridgeError::Disposed);
        }
    }
}

/// Buffer an existing stream through a [`BufferedBridge`].
pub fn buffer<S>(stream: S, config: BridgeConfig) -> BufferedBridge<S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    BufferedBridge::new(config, move |emitter, token| {
        pump(stream.map(Ok), emitter, token)
    })
}

/// Like [`buffer`], for streams whose errors should terminate the bridge.
pub fn try_buffer<S, T>(stream: S, config: BridgeConfig) -> BufferedBridge<T>
where
    S: Stream<Item = BridgeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    BufferedBridge::new(config, move |emitter, token| pump(stream, emitter, token))
}

async fn pump<S, T>(stream: S, mut emitter: Emitter<T>, token: CancellationToken) -> BridgeResult<()>
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
            Some(Ok(item)) => emitter.emit(item).await?,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
