//! N-ary rendezvous combinator (zip and combine-latest).
//!
//! One worker task per source pulls items and deposits them in that source's
//! slot. Arrivals are tracked in a bitmask; when the release condition holds,
//! the arriving worker runs the combining function and hands the result to
//! the consumer. Workers that contributed stay suspended at their gate until
//! the consumer pulls again, which opens every gate at once.
//!
//! In [`CombineMode::Zip`] the release condition is "every source arrived in
//! this round", so the i-th result always combines the i-th item of every
//! source, and the first source to end ends the combination. In
//! [`CombineMode::Latest`] every arrival after the first full round releases
//! a result built from the newest value of each source.
//!
//! # Examples
//! ```
//! use rs2_bridge::*;
//! use futures_util::stream;
//!
//! # async fn example() -> BridgeResult<()> {
//! let mut zipped = zip_all(
//!     vec![stream::iter(vec![1, 2, 3]), stream::iter(vec![10, 20])],
//!     |values: Vec<i32>| values.iter().sum::<i32>(),
//! );
//! let mut sums = Vec::new();
//! while zipped.try_advance().await? {
//!     sums.extend(zipped.take_current());
//! }
//! assert_eq!(sums, vec![11, 22]);
//! # Ok(())
//! # }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures_core::Stream;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ErrorAggregator;
use crate::completion::{CompletionHandle, CompletionState};
use crate::config::{CombineConfig, CombineMode};
use crate::error::{BridgeError, BridgeResult};
use crate::pull::AsyncPull;
use crate::state_word::StateLock;

const INITIAL: i32 = 0;
const PULLING: i32 = 1;
const PUSHING: i32 = 2;
const COMPLETED: i32 = 3;
const FINAL: i32 = 4;

/// Source stream accepted by the combinator.
pub type Source<T> = BoxStream<'static, BridgeResult<T>>;

type CombineFn<T, O> = Box<dyn Fn(Vec<T>) -> BridgeResult<O> + Send + Sync>;
type SnapshotFn<T> = fn(&mut [Option<T>]) -> Vec<T>;

/// Consumer-side phase of a [`RendezvousCombinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Initial,
    /// Waiting for arrivals
    Pulling,
    /// A combined value was released; contributors are held
    Pushing,
    /// Every worker exited; the terminal result is pending
    Completed,
    Final,
}

impl RendezvousState {
    fn from_word(word: i32) -> Self {
        match word {
            INITIAL => RendezvousState::Initial,
            PULLING => RendezvousState::Pulling,
            PUSHING => RendezvousState::Pushing,
            COMPLETED => RendezvousState::Completed,
            _ => RendezvousState::Final,
        }
    }
}

/// Fixed-size set of arrival bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalMask {
    words: Vec<u64>,
    len: usize,
    count: usize,
}

impl ArrivalMask {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
            len,
            count: 0,
        }
    }

    /// Mark `index` as arrived. Returns false if it already was.
    pub fn set(&mut self, index: usize) -> bool {
        assert!(index < self.len, "ArrivalMask: index out of range");
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        if self.words[word] & bit != 0 {
            return false;
        }
        self.words[word] |= bit;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.count = 0;
    }
}

struct Round<T, O> {
    slots: Vec<Option<T>>,
    arrived: ArrivalMask,
    held: Vec<bool>,
    ready: Option<O>,
    consumer_waiting: bool,
    active: usize,
    terminating: bool,
    dropped: u64,
    /// Sequence of the newest snapshot taken.
    stamped: u64,
    /// Sequence of the newest combination handed to the consumer side.
    published: u64,
}

impl<T, O> Round<T, O> {
    fn take_held(&mut self) -> Vec<usize> {
        self.held
            .iter_mut()
            .enumerate()
            .filter_map(|(index, held)| std::mem::take(held).then_some(index))
            .collect()
    }
}

struct Shared<T, O> {
    round: StateLock<Round<T, O>>,
    pull: CompletionHandle<Option<O>>,
    gates: Vec<CompletionHandle<()>>,
    combine: CombineFn<T, O>,
    snapshot: SnapshotFn<T>,
    mode: CombineMode,
    capture_context: bool,
    aggregator: ErrorAggregator,
}

enum Arrival<T> {
    Hold,
    Continue,
    Combine(u64, Vec<T>),
}

impl<T, O> Shared<T, O> {
    /// Deposit `value` for source `index` and wait at the gate if this
    /// worker has to be held.
    async fn arrive(&self, index: usize, value: T, token: &CancellationToken) -> BridgeResult<()> {
        let arrival = {
            let mut round = self.round.lock();
            if round.terminating {
                return Err(BridgeError::Cancelled);
            }
            round.slots[index] = Some(value);
            round.arrived.set(index);
            match self.mode {
                CombineMode::Zip => {
                    self.hold(&mut round, index)?;
                    if round.arrived.is_full() {
                        round.arrived.clear();
                        round.stamped += 1;
                        Arrival::Combine(round.stamped, (self.snapshot)(&mut round.slots))
                    } else {
                        Arrival::Hold
                    }
                }
                CombineMode::Latest if round.arrived.is_full() => {
                    self.hold(&mut round, index)?;
                    round.stamped += 1;
                    Arrival::Combine(round.stamped, (self.snapshot)(&mut round.slots))
                }
                CombineMode::Latest => Arrival::Continue,
            }
        };

        match arrival {
            Arrival::Continue => return Ok(()),
            Arrival::Hold => {}
            Arrival::Combine(sequence, values) => {
                let combined = catch_unwind(AssertUnwindSafe(|| (self.combine)(values)))
                    .unwrap_or_else(|_| Err(BridgeError::fault("combining function panicked")))?;
                self.publish(sequence, combined);
            }
        }

        tokio::select! {
            biased;
            opened = self.gates[index].wait() => opened,
            _ = token.cancelled() => Err(BridgeError::Cancelled),
        }
    }

    fn hold(&self, round: &mut Round<T, O>, index: usize) -> BridgeResult<()> {
        if self.gates[index].state() == CompletionState::Completed {
            self.gates[index].get_result()?;
        }
        self.gates[index].reset(false)?;
        round.held[index] = true;
        Ok(())
    }

    /// Hand `combined` to the consumer, or park it in the ready slot.
    /// Combines run outside the lock and may finish out of order; a result
    /// older than one already published is dropped.
    fn publish(&self, sequence: u64, combined: O) {
        let deliver = {
            let mut round = self.round.lock();
            if round.terminating {
                return;
            }
            if sequence <= round.published {
                round.dropped += 1;
                log::debug!("dropping stale combination {} (published {})", sequence, round.published);
                return;
            }
            round.published = sequence;
            round.set_state(PUSHING);
            if round.consumer_waiting {
                round.consumer_waiting = false;
                Some(combined)
            } else {
                if round.ready.replace(combined).is_some() {
                    round.dropped += 1;
                }
                None
            }
        };
        if let Some(combined) = deliver {
            let _ = self.pull.set_value(Some(combined));
        }
    }

    fn worker_finished(&self, index: usize, result: BridgeResult<()>) {
        self.aggregator.record_exit(&result);
        let (cancel, release, wake_pull) = {
            let mut round = self.round.lock();
            round.active -= 1;
            let ends = match self.mode {
                CombineMode::Zip => true,
                CombineMode::Latest => result.is_err() || !round.arrived.contains(index),
            };
            let cancel = ends && !round.terminating;
            if ends {
                round.terminating = true;
            }
            let release = if round.terminating {
                round.take_held()
            } else {
                Vec::new()
            };
            let mut wake_pull = false;
            if round.active == 0 {
                if round.consumer_waiting {
                    round.consumer_waiting = false;
                    round.set_state(FINAL);
                    wake_pull = true;
                } else {
                    round.set_state(COMPLETED);
                }
            }
            (cancel, release, wake_pull)
        };
        log::trace!("rendezvous: worker {} finished ({:?})", index, result);

        if cancel {
            self.aggregator.cancel();
        }
        for held in release {
            let _ = self.gates[held].set_error(BridgeError::Cancelled);
        }
        if wake_pull {
            let terminal = self.aggregator.throw_if_error();
            log::debug!("rendezvous: all workers exited ({:?})", terminal);
            let _ = self.pull.set_result(terminal.map(|_| None));
        }
    }
}

async fn run_worker<T, O>(shared: Arc<Shared<T, O>>, index: usize, mut source: Source<T>)
where
    T: Send + 'static,
    O: Send + 'static,
{
    let token = shared.aggregator.token();
    let result = drive(&shared, index, &mut source, &token).await;
    shared.worker_finished(index, result);
}

async fn drive<T, O>(
    shared: &Shared<T, O>,
    index: usize,
    source: &mut Source<T>,
    token: &CancellationToken,
) -> BridgeResult<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BridgeError::Cancelled),
            next = source.next() => next,
        };
        match next {
            Some(Ok(value)) => shared.arrive(index, value, token).await?,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

fn take_slots<T>(slots: &mut [Option<T>]) -> Vec<T> {
    slots.iter_mut().filter_map(Option::take).collect()
}

fn clone_slots<T: Clone>(slots: &mut [Option<T>]) -> Vec<T> {
    slots.iter().flatten().cloned().collect()
}

/// Combines N sources into one pull-based sequence.
pub struct RendezvousCombinator<T, O> {
    shared: Arc<Shared<T, O>>,
    sources: Vec<Source<T>>,
    tasks: Vec<JoinHandle<()>>,
    current: Option<O>,
    finished: bool,
    disposed: bool,
}

enum Step<O> {
    Start,
    Wait(Vec<usize>),
    Value(O, Vec<usize>),
    Finish,
    End,
}

impl<T, O> RendezvousCombinator<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    fn build<F>(sources: Vec<Source<T>>, config: CombineConfig, snapshot: SnapshotFn<T>, combine: F) -> Self
    where
        F: Fn(Vec<T>) -> BridgeResult<O> + Send + Sync + 'static,
    {
        let n = sources.len();
        let shared = Arc::new(Shared {
            round: StateLock::new(
                INITIAL,
                Round {
                    slots: (0..n).map(|_| None).collect(),
                    arrived: ArrivalMask::new(n),
                    held: vec![false; n],
                    ready: None,
                    consumer_waiting: false,
                    active: n,
                    terminating: false,
                    dropped: 0,
                    stamped: 0,
                    published: 0,
                },
            ),
            pull: CompletionHandle::new(),
            gates: (0..n).map(|_| CompletionHandle::new()).collect(),
            combine: Box::new(combine),
            snapshot,
            mode: config.mode,
            capture_context: config.capture_context,
            aggregator: ErrorAggregator::new(config.cancellation),
        });
        Self {
            shared,
            sources,
            tasks: Vec::with_capacity(n),
            current: None,
            finished: false,
            disposed: false,
        }
    }

    /// Zip `sources` in lock step with a fallible combining function.
    pub fn zip<F>(sources: Vec<Source<T>>, config: CombineConfig, combine: F) -> Self
    where
        F: Fn(Vec<T>) -> BridgeResult<O> + Send + Sync + 'static,
    {
        let config = CombineConfig {
            mode: CombineMode::Zip,
            ..config
        };
        Self::build(sources, config, take_slots::<T>, combine)
    }

    /// Number of sources.
    pub fn width(&self) -> usize {
        self.shared.gates.len()
    }

    /// Workers that have not exited yet.
    pub fn active_workers(&self) -> usize {
        self.shared.round.lock().active
    }

    /// Combined values replaced before the consumer took them (latest mode).
    pub fn dropped(&self) -> u64 {
        self.shared.round.lock().dropped
    }

    pub fn state(&self) -> RendezvousState {
        RendezvousState::from_word(self.shared.round.state())
    }

    fn start(&mut self) {
        log::debug!(
            "rendezvous: starting {} workers ({:?})",
            self.sources.len(),
            self.shared.mode
        );
        for (index, source) in self.sources.drain(..).enumerate() {
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(run_worker(shared, index, source)));
        }
    }

    async fn await_pull(&mut self) -> BridgeResult<bool> {
        match self.shared.pull.wait().await {
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

    fn open_gates(&self, release: Vec<usize>) {
        for index in release {
            let _ = self.shared.gates[index].set_value(());
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

        let step = {
            let shared = &self.shared;
            let mut round = shared.round.lock();
            match round.state() {
                INITIAL if round.active == 0 => {
                    round.set_state(FINAL);
                    Step::End
                }
                INITIAL => {
                    shared.pull.reset(shared.capture_context)?;
                    round.consumer_waiting = true;
                    round.set_state(PULLING);
                    Step::Start
                }
                PULLING | PUSHING => {
                    let release = round.take_held();
                    match round.ready.take() {
                        Some(value) => Step::Value(value, release),
                        None => {
                            shared.pull.reset(shared.capture_context)?;
                            round.consumer_waiting = true;
                            round.set_state(PULLING);
                            Step::Wait(release)
                        }
                    }
                }
                COMPLETED => match round.ready.take() {
                    Some(value) if !shared.aggregator.has_error() => Step::Value(value, Vec::new()),
                    _ => {
                        round.set_state(FINAL);
                        Step::Finish
                    }
                },
                _ => Step::End,
            }
        };

        match step {
            Step::Start => {
                self.start();
                self.await_pull().await
            }
            Step::Wait(release) => {
                self.open_gates(release);
                self.await_pull().await
            }
            Step::Value(value, release) => {
                self.open_gates(release);
                self.current = Some(value);
                Ok(true)
            }
            Step::Finish => {
                self.finished = true;
                self.shared.aggregator.throw_if_error().map(|_| false)
            }
            Step::End => {
                self.finished = true;
                Ok(false)
            }
        }
    }

    fn begin_dispose(&mut self) {
        self.disposed = true;
        self.finished = true;
        self.current = None;
        self.sources.clear();
        let shared = &self.shared;
        shared.aggregator.set_external_error(BridgeError::Disposed);
        let (release, release_pull) = {
            let mut round = shared.round.lock();
            round.terminating = true;
            round.ready = None;
            if round.state() == INITIAL {
                round.set_state(FINAL);
            }
            (round.take_held(), std::mem::take(&mut round.consumer_waiting))
        };
        for index in release {
            let _ = shared.gates[index].set_error(BridgeError::Disposed);
        }
        if release_pull {
            let _ = shared.pull.set_error(BridgeError::Disposed);
        }
        if shared.pull.is_completed() {
            let _ = shared.pull.get_result();
        }
    }
}

impl<T, O> RendezvousCombinator<T, O>
where
    T: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Release a combination of the newest values on every arrival once
    /// each source has produced at least one.
    pub fn latest<F>(sources: Vec<Source<T>>, config: CombineConfig, combine: F) -> Self
    where
        F: Fn(Vec<T>) -> BridgeResult<O> + Send + Sync + 'static,
    {
        let config = CombineConfig {
            mode: CombineMode::Latest,
            ..config
        };
        Self::build(sources, config, clone_slots::<T>, combine)
    }

    /// Build from a config, picking the release discipline from its mode.
    pub fn with_config<F>(sources: Vec<Source<T>>, config: CombineConfig, combine: F) -> Self
    where
        F: Fn(Vec<T>) -> BridgeResult<O> + Send + Sync + 'static,
    {
        match config.mode {
            CombineMode::Zip => Self::zip(sources, config, combine),
            CombineMode::Latest => Self::latest(sources, config, combine),
        }
    }
}

#[async_trait]
impl<T, O> AsyncPull for RendezvousCombinator<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    type Item = O;

    async fn try_advance(&mut self) -> BridgeResult<bool> {
        self.advance().await
    }

    fn current(&self) -> Option<&O> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<O> {
        self.current.take()
    }

    async fn dispose(&mut self) {
        if !self.disposed {
            self.begin_dispose();
        }
        for joined in join_all(self.tasks.drain(..)).await {
            if let Err(e) = joined {
                log::warn!("rendezvous: worker task failed: {}", e);
            }
        }
        let mut round = self.shared.round.lock();
        round.set_state(FINAL);
    }
}

impl<T, O> Drop for RendezvousCombinator<T, O> {
    fn drop(&mut self) {
        if self.disposed || self.tasks.is_empty() {
            return;
        }
        log::debug!("rendezvous dropped without dispose; cancelling workers");
        self.shared.aggregator.set_external_error(BridgeError::Disposed);
        let release = {
            let mut round = self.shared.round.lock();
            round.terminating = true;
            round.take_held()
        };
        for index in release {
            let _ = self.shared.gates[index].set_error(BridgeError::Disposed);
        }
    }
}

/// Zip infallible streams with an N-ary combining function. The shortest
/// source ends the combination.
pub fn zip_all<S, T, O, F>(sources: Vec<S>, combine: F) -> RendezvousCombinator<T, O>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<T>) -> O + Send + Sync + 'static,
{
    let sources = sources.into_iter().map(|s| s.map(Ok).boxed()).collect();
    RendezvousCombinator::zip(sources, CombineConfig::zip(), move |values| Ok(combine(values)))
}

/// Zip fallible streams with a fallible combining function. The first error
/// from any source or from `combine` terminates the combination.
pub fn try_zip_all<S, T, O, F>(sources: Vec<S>, config: CombineConfig, combine: F) -> RendezvousCombinator<T, O>
where
    S: Stream<Item = BridgeResult<T>> + Send + 'static,
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<T>) -> BridgeResult<O> + Send + Sync + 'static,
{
    let sources = sources.into_iter().map(|s| s.boxed()).collect();
    RendezvousCombinator::zip(sources, config, combine)
}

/// Combine the newest values of infallible streams.
pub fn combine_latest<S, T, O, F>(sources: Vec<S>, combine: F) -> RendezvousCombinator<T, O>
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<T>) -> O + Send + Sync + 'static,
{
    let sources = sources.into_iter().map(|s| s.map(Ok).boxed()).collect();
    RendezvousCombinator::latest(sources, CombineConfig::latest(), move |values| Ok(combine(values)))
}

#[cfg(test)]
mod tests {
    use super::ArrivalMask;

    #[test]
    fn arrival_mask_spans_words() {
        let mut mask = ArrivalMask::new(70);
        assert!(mask.set(0));
        assert!(mask.set(69));
        assert!(!mask.set(69));
        assert!(mask.contains(69));
        assert!(!mask.contains(64));
        assert_eq!(mask.count(), 2);
        for i in 0..70 {
            mask.set(i);
        }
        assert!(mask.is_full());
        mask.clear();
        assert_eq!(mask.count(), 0);
        assert!(!mask.contains(0));
    }
}
