//! First-error-wins coordination between concurrently running workers.
//!
//! An [`ErrorAggregator`] is created per bridge or combinator. It records at
//! most one external error (an outside cancellation or disposal) and at most
//! one internal error (a worker or combiner fault). Recording either one
//! cancels the derived internal token that every worker observes.

use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, BridgeResult};
use crate::state_word::StateLock;

const CLEAN: i32 = 0;
const EXTERNAL_SET: i32 = 1;
const INTERNAL_SET: i32 = 2;
const CANCELLED: i32 = 4;

#[derive(Default)]
struct Recorded {
    external: Option<BridgeError>,
    internal: Option<BridgeError>,
}

/// Coalesces the first error seen across workers.
pub struct ErrorAggregator {
    recorded: StateLock<Recorded>,
    external: Option<CancellationToken>,
    internal: CancellationToken,
}

impl ErrorAggregator {
    /// Create an aggregator. When an external token is supplied the internal
    /// token is its child, so outside cancellation reaches every worker.
    pub fn new(external: Option<CancellationToken>) -> Self {
        let internal = match &external {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            recorded: StateLock::new(CLEAN, Recorded::default()),
            external,
            internal,
        }
    }

    /// Record an external error if none has been recorded yet. Returns
    /// whether this call won.
    pub fn set_external_error(&self, error: BridgeError) -> bool {
        let won = {
            let mut recorded = self.recorded.lock();
            if recorded.external.is_some() {
                false
            } else {
                recorded.external = Some(error);
                let state = recorded.state() | EXTERNAL_SET;
                recorded.set_state(state);
                true
            }
        };
        self.cancel();
        won
    }

    /// Record an internal error if none has been recorded yet. Returns
    /// whether this call won.
    pub fn set_internal_error(&self, error: BridgeError) -> bool {
        let won = {
            let mut recorded = self.recorded.lock();
            if recorded.internal.is_some() {
                false
            } else {
                log::debug!("aggregator: first internal error: {}", error);
                recorded.internal = Some(error);
                let state = recorded.state() | INTERNAL_SET;
                recorded.set_state(state);
                true
            }
        };
        self.cancel();
        won
    }

    /// Fire the internal cancellation signal. Only the first call has an
    /// effect.
    pub fn cancel(&self) {
        let first = {
            let mut recorded = self.recorded.lock();
            let state = recorded.state();
            recorded.set_state(state | CANCELLED);
            state & CANCELLED == 0
        };
        if first {
            self.internal.cancel();
        }
    }

    /// Feed a worker's exit status in. Cancellation errors that merely echo
    /// our own signal are not recorded; outside cancellation is recorded as
    /// external.
    pub fn record_exit(&self, result: &BridgeResult<()>) {
        let error = match result {
            Ok(()) => return,
            Err(error) => error,
        };
        if self.external_cancelled() {
            self.set_external_error(BridgeError::Cancelled);
        } else if error.is_cancellation() {
            if !self.is_cancelled() {
                self.set_external_error(error.clone());
            }
        } else {
            self.set_internal_error(error.clone());
        }
    }

    /// The token workers must observe.
    pub fn token(&self) -> CancellationToken {
        self.internal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.internal.is_cancelled()
    }

    fn external_cancelled(&self) -> bool {
        self.external
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// The error the consumer should see, if any. External errors take
    /// priority over internal ones.
    pub fn error(&self) -> Option<BridgeError> {
        if self.external_cancelled() {
            self.set_external_error(BridgeError::Cancelled);
        }
        let recorded = self.recorded.lock();
        recorded
            .external
            .clone()
            .or_else(|| recorded.internal.clone())
    }

    /// Return the recorded error, external first, or `Ok(())`.
    pub fn throw_if_error(&self) -> BridgeResult<()> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn has_error(&self) -> bool {
        self.recorded.state() & (EXTERNAL_SET | INTERNAL_SET) != 0 || self.external_cancelled()
    }
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for ErrorAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let recorded = self.recorded.lock();
        f.debug_struct("ErrorAggregator")
            .field("external", &recorded.external)
            .field("internal", &recorded.internal)
            .field("cancelled", &self.internal.is_cancelled())
            .finish()
    }
}
