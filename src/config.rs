//! Configuration types for bridges and combinators

use tokio_util::sync::CancellationToken;

/// Maximum number of items a producer may get ahead of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBound {
    /// The producer is suspended once this many items are queued
    Bounded(usize),
    /// No backpressure; the producer never suspends
    Unbounded,
}

impl QueueBound {
    /// Whether `queued` items exhaust the bound.
    pub fn is_reached(&self, queued: usize) -> bool {
        match self {
            QueueBound::Bounded(max) => queued >= *max,
            QueueBound::Unbounded => false,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            QueueBound::Bounded(max) => Some(*max),
            QueueBound::Unbounded => None,
        }
    }
}

/// Configuration for single-producer bridges
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bound: QueueBound,
    /// Queue capacity kept after the queue drains; anything above is freed
    pub retained_capacity: usize,
    /// Resume callback continuations on the runtime that armed them
    pub capture_context: bool,
    /// Outside cancellation signal
    pub cancellation: Option<CancellationToken>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bound: QueueBound::Bounded(100),
            retained_capacity: 16,
            capture_context: false,
            cancellation: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with the given queue bound
    pub fn bounded(max: usize) -> Self {
        Self::default().bound(max)
    }

    /// Configuration without backpressure
    pub fn unbounded() -> Self {
        Self::default().no_bound()
    }

    /// Set the queue bound
    pub fn bound(mut self, max: usize) -> Self {
        assert!(max > 0, "bound: queue bound must be greater than 0");
        self.bound = QueueBound::Bounded(max);
        self
    }

    /// Disable backpressure
    pub fn no_bound(mut self) -> Self {
        self.bound = QueueBound::Unbounded;
        self
    }

    /// Set the capacity retained after the queue drains
    pub fn retained_capacity(mut self, capacity: usize) -> Self {
        self.retained_capacity = capacity;
        self
    }

    pub fn capture_context(mut self, capture: bool) -> Self {
        self.capture_context = capture;
        self
    }

    /// Attach an outside cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Release discipline of a rendezvous combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// Release once every source has contributed; sources advance in lock step
    Zip,
    /// Release on every arrival after the first full round
    Latest,
}

/// Configuration for rendezvous combinators
#[derive(Debug, Clone)]
pub struct CombineConfig {
    pub mode: CombineMode,
    pub capture_context: bool,
    pub cancellation: Option<CancellationToken>,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            mode: CombineMode::Zip,
            capture_context: false,
            cancellation: None,
        }
    }
}

impl CombineConfig {
    pub fn zip() -> Self {
        Self::default()
    }

    pub fn latest() -> Self {
        Self {
            mode: CombineMode::Latest,
            ..Self::default()
        }
    }

    pub fn capture_context(mut self, capture: bool) -> Self {
        self.capture_context = capture;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
