//! Sign-bit spinlock over a single state register.
//!
//! Every state machine in this crate keeps its current state in a
//! [`StateWord`]. Non-negative values are unlocked states; while a task holds
//! the lock the sign bit is set. Critical sections are short and never await,
//! so contention is resolved by spinning with a small backoff instead of
//! parking the OS thread.
//!
//! [`StateLock`] pairs a word with the data it protects and hands out a
//! [`StateGuard`] that restores a non-negative state when dropped, including
//! on unwinding paths.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};

const LOCK_BIT: i32 = i32::MIN;

/// Bounded spin, then yield. Never parks.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Perform one wait step: exponential spin first, then yield the thread.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Whether the backoff has moved past the spinning phase.
    pub fn is_yielding(&self) -> bool {
        self.step > Self::SPIN_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer state register whose sign bit is a spinlock.
#[derive(Debug)]
pub struct StateWord {
    word: AtomicI32,
}

impl StateWord {
    /// Create a register holding `initial`, which must be non-negative.
    pub const fn new(initial: i32) -> Self {
        assert!(initial >= 0, "StateWord: initial state must be non-negative");
        Self {
            word: AtomicI32::new(initial),
        }
    }

    /// Spin until the lock bit is clear, set it, and return the unlocked
    /// value that was held.
    pub fn lock(&self) -> i32 {
        let mut backoff = Backoff::new();
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current >= 0
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current | LOCK_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return current;
            }
            backoff.snooze();
        }
    }

    /// Release the lock by publishing `value`.
    ///
    /// Panics if `value` is negative; a negative value would leave the word
    /// locked forever.
    pub fn unlock(&self, value: i32) {
        assert!(value >= 0, "StateWord: cannot release with a negative state");
        debug_assert!(self.is_locked(), "StateWord: unlock without lock");
        self.word.store(value, Ordering::Release);
    }

    /// Replace the state under the lock and return the previous one.
    pub fn exchange(&self, value: i32) -> i32 {
        let previous = self.lock();
        self.unlock(value);
        previous
    }

    /// Replace the state with `value` only if it currently equals `expected`.
    /// Returns the previous state either way.
    pub fn compare_exchange(&self, value: i32, expected: i32) -> i32 {
        let previous = self.lock();
        self.unlock(if previous == expected { value } else { previous });
        previous
    }

    /// Snapshot of the state. While locked this is the value held before the
    /// lock was taken.
    pub fn load(&self) -> i32 {
        self.word.load(Ordering::Acquire) & !LOCK_BIT
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) < 0
    }
}

/// Data guarded by a [`StateWord`].
pub struct StateLock<T> {
    word: StateWord,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `StateGuard`, and at most one
// guard exists at a time because the guard owns the word's lock bit.
unsafe impl<T: Send> Send for StateLock<T> {}
unsafe impl<T: Send> Sync for StateLock<T> {}

impl<T> StateLock<T> {
    pub fn new(initial: i32, data: T) -> Self {
        Self {
            word: StateWord::new(initial),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock. The guard starts out holding the current state and
    /// writes back whatever state it holds when dropped.
    pub fn lock(&self) -> StateGuard<'_, T> {
        let state = self.word.lock();
        StateGuard { lock: self, state }
    }

    /// Unlocked snapshot of the state register.
    pub fn state(&self) -> i32 {
        self.word.load()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StateLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock")
            .field("state", &self.state())
            .field("locked", &self.word.is_locked())
            .finish()
    }
}

/// Exclusive access to a [`StateLock`]'s data and state.
pub struct StateGuard<'a, T> {
    lock: &'a StateLock<T>,
    state: i32,
}

impl<'a, T> StateGuard<'a, T> {
    /// The state as of lock acquisition, or as last set through this guard.
    pub fn state(&self) -> i32 {
        self.state
    }

    /// Stage a new state; it is published when the guard is dropped.
    pub fn set_state(&mut self, state: i32) {
        assert!(state >= 0, "StateGuard: state must be non-negative");
        self.state = state;
    }
}

impl<'a, T> Deref for StateGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock bit.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for StateGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock bit and is borrowed mutably.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for StateGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.word.unlock(self.state);
    }
}
