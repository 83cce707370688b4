//! Resettable single-shot completion handles.
//!
//! A [`CompletionHandle`] connects exactly one producer-side
//! [`set_result`](CompletionHandle::set_result) to exactly one consumer-side
//! retrieval, then returns to `Initial` so the same allocation serves the
//! next operation. The consumer either awaits [`wait`](CompletionHandle::wait),
//! registers a callback with [`on_completed`](CompletionHandle::on_completed),
//! or blocks with [`blocking_get_result`](CompletionHandle::blocking_get_result).
//!
//! [`HandlePool`] recycles handles through a free list keyed by
//! [`HandleKey`]; keys carry a generation so a key kept past its return is
//! rejected instead of aliasing the next renter.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tokio::runtime::Handle;

use crate::error::{BridgeError, BridgeResult};
use crate::state_word::StateLock;

const INITIAL: i32 = 0;
const PENDING: i32 = 1;
const COMPLETED: i32 = 2;
const FINAL: i32 = 3;

/// Observable lifecycle of a [`CompletionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Initial,
    Pending,
    Completed,
    /// Retired into a pool; every operation fails until it is rented again.
    Final,
}

impl CompletionState {
    fn from_word(word: i32) -> Self {
        match word {
            INITIAL => CompletionState::Initial,
            PENDING => CompletionState::Pending,
            COMPLETED => CompletionState::Completed,
            _ => CompletionState::Final,
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Continuation {
    Waker(Waker),
    Callback(Callback),
}

struct Slot<T> {
    result: Option<BridgeResult<T>>,
    continuation: Option<Continuation>,
    context: Option<Handle>,
    registered: bool,
}

/// Single-shot, resettable future.
pub struct CompletionHandle<T> {
    slot: StateLock<Slot<T>>,
}

impl<T> CompletionHandle<T> {
    pub fn new() -> Self {
        Self {
            slot: StateLock::new(
                INITIAL,
                Slot {
                    result: None,
                    continuation: None,
                    context: None,
                    registered: false,
                },
            ),
        }
    }

    pub fn state(&self) -> CompletionState {
        CompletionState::from_word(self.slot.state())
    }

    /// Non-blocking readiness check.
    pub fn is_completed(&self) -> bool {
        self.slot.state() == COMPLETED
    }

    /// Arm the handle for one operation (Initial -> Pending).
    ///
    /// With `capture_context` set and a tokio runtime present, callback
    /// continuations are later spawned onto that runtime instead of running
    /// on the completing task.
    pub fn reset(&self, capture_context: bool) -> BridgeResult<()> {
        let mut slot = self.slot.lock();
        match slot.state() {
            INITIAL => {
                slot.context = if capture_context {
                    Handle::try_current().ok()
                } else {
                    None
                };
                slot.continuation = None;
                slot.registered = false;
                slot.set_state(PENDING);
                Ok(())
            }
            FINAL => Err(BridgeError::StaleHandle),
            _ => Err(BridgeError::Misuse("reset while a completion is outstanding")),
        }
    }

    /// Complete the operation (Pending -> Completed) and run or schedule the
    /// registered continuation, if any. Completing twice is rejected.
    pub fn set_result(&self, result: BridgeResult<T>) -> BridgeResult<()> {
        let (continuation, context) = {
            let mut slot = self.slot.lock();
            match slot.state() {
                PENDING => {}
                FINAL => return Err(BridgeError::StaleHandle),
                COMPLETED => return Err(BridgeError::Misuse("handle completed twice")),
                _ => return Err(BridgeError::Misuse("handle completed before reset")),
            }
            slot.result = Some(result);
            slot.set_state(COMPLETED);
            (slot.continuation.take(), slot.context.clone())
        };
        if let Some(continuation) = continuation {
            dispatch(continuation, context);
        }
        Ok(())
    }

    pub fn set_value(&self, value: T) -> BridgeResult<()> {
        self.set_result(Ok(value))
    }

    pub fn set_error(&self, error: BridgeError) -> BridgeResult<()> {
        self.set_result(Err(error))
    }

    /// Register a callback to run once the handle completes. If it already
    /// has, the callback runs (or is scheduled) immediately. Only one
    /// continuation may be registered per armed operation.
    pub fn on_completed<F>(&self, callback: F) -> BridgeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let context = {
            let mut slot = self.slot.lock();
            match slot.state() {
                INITIAL => return Err(BridgeError::Misuse("continuation registered before reset")),
                FINAL => return Err(BridgeError::StaleHandle),
                _ if slot.registered => {
                    return Err(BridgeError::Misuse("continuation already registered"))
                }
                PENDING => {
                    slot.registered = true;
                    slot.continuation = Some(Continuation::Callback(Box::new(callback)));
                    return Ok(());
                }
                _ => {
                    slot.registered = true;
                    slot.context.clone()
                }
            }
        };
        dispatch(Continuation::Callback(Box::new(callback)), context);
        Ok(())
    }

    /// Take the result (Completed -> Initial). Reading before completion is
    /// a protocol error.
    pub fn get_result(&self) -> BridgeResult<T> {
        let mut slot = self.slot.lock();
        match slot.state() {
            COMPLETED => take_completed(&mut slot),
            FINAL => Err(BridgeError::StaleHandle),
            _ => Err(BridgeError::Misuse("result read before completion")),
        }
    }

    /// Poll for the result, registering `cx`'s waker as the continuation.
    /// Re-polling from the same awaiter replaces the waker.
    pub fn poll_result(&self, cx: &mut Context<'_>) -> Poll<BridgeResult<T>> {
        let mut slot = self.slot.lock();
        match slot.state() {
            COMPLETED => Poll::Ready(take_completed(&mut slot)),
            PENDING => {
                match &slot.continuation {
                    Some(Continuation::Callback(_)) => {
                        return Poll::Ready(Err(BridgeError::Misuse(
                            "awaited a handle that has a callback continuation",
                        )))
                    }
                    Some(Continuation::Waker(waker)) if waker.will_wake(cx.waker()) => {
                        return Poll::Pending
                    }
                    _ => {}
                }
                slot.registered = true;
                slot.continuation = Some(Continuation::Waker(cx.waker().clone()));
                Poll::Pending
            }
            FINAL => Poll::Ready(Err(BridgeError::StaleHandle)),
            _ => Poll::Ready(Err(BridgeError::Misuse("awaited before reset"))),
        }
    }

    /// Future resolving to the result once the handle completes.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { handle: self }
    }

    /// Block the calling thread until completion, then take the result.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_get_result(&self) -> BridgeResult<T> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        self.on_completed(move || {
            let _ = tx.send(());
        })?;
        rx.blocking_recv()
            .map_err(|_| BridgeError::Misuse("continuation dropped without running"))?;
        self.get_result()
    }

    /// Move an idle handle into the terminal `Final` state.
    pub(crate) fn retire(&self) -> BridgeResult<()> {
        let mut slot = self.slot.lock();
        match slot.state() {
            INITIAL => {
                slot.set_state(FINAL);
                Ok(())
            }
            FINAL => Err(BridgeError::StaleHandle),
            _ => Err(BridgeError::Misuse("handle returned while an operation is outstanding")),
        }
    }

    /// Bring a retired handle back to `Initial`.
    pub(crate) fn revive(&self) {
        let mut slot = self.slot.lock();
        if slot.state() == FINAL {
            slot.set_state(INITIAL);
        }
    }
}

fn take_completed<T>(slot: &mut crate::state_word::StateGuard<'_, Slot<T>>) -> BridgeResult<T> {
    let result = slot.result.take();
    slot.continuation = None;
    slot.context = None;
    slot.registered = false;
    slot.set_state(INITIAL);
    result.unwrap_or(Err(BridgeError::Misuse("completed handle held no result")))
}

fn dispatch(continuation: Continuation, context: Option<Handle>) {
    match continuation {
        Continuation::Waker(waker) => waker.wake(),
        Continuation::Callback(callback) => match context {
            Some(handle) => {
                handle.spawn(async move { run_guarded(callback) });
            }
            None => run_guarded(callback),
        },
    }
}

// The completing side is done regardless of what the continuation does.
fn run_guarded(callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::warn!("completion continuation panicked; ignoring");
    }
}

impl<T> Default for CompletionHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Future returned by [`CompletionHandle::wait`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait<'a, T> {
    handle: &'a CompletionHandle<T>,
}

impl<'a, T> Future for Wait<'a, T> {
    type Output = BridgeResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.handle.poll_result(cx)
    }
}

/// Address of a rented handle in a [`HandlePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey {
    index: usize,
    generation: u64,
}

impl HandleKey {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct PoolEntry<T> {
    handle: Arc<CompletionHandle<T>>,
    generation: u64,
    rented: bool,
}

struct PoolSlots<T> {
    entries: Vec<PoolEntry<T>>,
    free: Vec<usize>,
}

/// Free-list arena of reusable completion handles.
pub struct HandlePool<T> {
    slots: StateLock<PoolSlots<T>>,
}

impl<T> HandlePool<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: StateLock::new(
                0,
                PoolSlots {
                    entries: Vec::with_capacity(capacity),
                    free: Vec::with_capacity(capacity),
                },
            ),
        }
    }

    /// Rent a handle in the `Initial` state, reusing a returned one when
    /// available.
    pub fn rent(&self) -> HandleKey {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            let entry = &mut slots.entries[index];
            entry.rented = true;
            entry.handle.revive();
            return HandleKey {
                index,
                generation: entry.generation,
            };
        }
        let index = slots.entries.len();
        slots.entries.push(PoolEntry {
            handle: Arc::new(CompletionHandle::new()),
            generation: 0,
            rented: true,
        });
        HandleKey {
            index,
            generation: 0,
        }
    }

    /// Resolve a key to its handle, rejecting keys that were returned.
    pub fn get(&self, key: HandleKey) -> BridgeResult<Arc<CompletionHandle<T>>> {
        let slots = self.slots.lock();
        match slots.entries.get(key.index) {
            Some(entry) if entry.rented && entry.generation == key.generation => {
                Ok(entry.handle.clone())
            }
            _ => Err(BridgeError::StaleHandle),
        }
    }

    /// Return an idle handle to the free list. The key becomes stale.
    pub fn give_back(&self, key: HandleKey) -> BridgeResult<()> {
        let mut slots = self.slots.lock();
        let entry = match slots.entries.get_mut(key.index) {
            Some(entry) if entry.rented && entry.generation == key.generation => entry,
            _ => return Err(BridgeError::StaleHandle),
        };
        entry.handle.retire()?;
        entry.rented = false;
        entry.generation += 1;
        slots.free.push(key.index);
        Ok(())
    }

    /// Take the result of a completed handle and return it to the pool in
    /// one step.
    pub fn take_result(&self, key: HandleKey) -> BridgeResult<T> {
        let handle = self.get(key)?;
        let result = handle.get_result();
        if !matches!(result, Err(BridgeError::Misuse(_))) {
            self.give_back(key)?;
        }
        result
    }

    /// Handles currently rented out.
    pub fn rented(&self) -> usize {
        let slots = self.slots.lock();
        slots.entries.len() - slots.free.len()
    }

    /// Handles waiting on the free list.
    pub fn available(&self) -> usize {
        self.slots.lock().free.len()
    }
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}
