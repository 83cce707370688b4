//! Consumer-side contract shared by every bridge.
//!
//! A consumer calls [`AsyncPull::try_advance`] strictly sequentially, reads
//! the item through [`AsyncPull::current`] or [`AsyncPull::take_current`],
//! and eventually calls [`AsyncPull::dispose`], which only returns once the
//! background producers have exited.

use std::fmt;
use std::future::Future;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeResult;

/// Pull-based iterator over values pushed by background producers.
#[async_trait]
pub trait AsyncPull: Send {
    type Item: Send + 'static;

    /// Advance to the next item, suspending until one is available.
    /// `Ok(false)` means the sequence ended cleanly. After the first error
    /// or end, every later call returns `Ok(false)`.
    async fn try_advance(&mut self) -> BridgeResult<bool>;

    /// The item produced by the last successful `try_advance`.
    fn current(&self) -> Option<&Self::Item>;

    /// Move the current item out.
    fn take_current(&mut self) -> Option<Self::Item>;

    /// Stop the producers, discard buffered items, and wait for every
    /// background task to exit.
    async fn dispose(&mut self);

    /// `try_advance` followed by `take_current`.
    async fn next_item(&mut self) -> Option<BridgeResult<Self::Item>> {
        match self.try_advance().await {
            Ok(true) => self.take_current().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Turn a puller into a boxed stream. The stream ends after the first error
/// and disposes the puller when it finishes.
pub fn into_stream<P>(puller: P) -> BoxStream<'static, BridgeResult<P::Item>>
where
    P: AsyncPull + 'static,
{
    stream! {
        let mut puller = puller;
        while let Some(next) = puller.next_item().await {
            let failed = next.is_err();
            yield next;
            if failed {
                break;
            }
        }
        puller.dispose().await;
    }
    .boxed()
}

/// Producer body as stored by the single-producer bridges.
pub(crate) type BoxedProducer<E> =
    Box<dyn FnOnce(E, CancellationToken) -> BoxFuture<'static, BridgeResult<()>> + Send>;

pub(crate) fn box_producer<E, F, Fut>(producer: F) -> BoxedProducer<E>
where
    F: FnOnce(E, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = BridgeResult<()>> + Send + 'static,
{
    Box::new(move |emitter, token| Box::pin(producer(emitter, token)))
}

/// Bridge statistics for monitoring and debugging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Items waiting in the queue
    pub queued: usize,
    /// Queue bound (None for unbounded)
    pub bound: Option<usize>,
    /// Whether the producer is currently suspended by backpressure
    pub producer_suspended: bool,
    /// Items handed to the consumer so far
    pub delivered: u64,
    /// Values overwritten before the consumer saw them
    pub dropped: u64,
    /// Largest queue length observed
    pub peak_queued: usize,
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound {
            Some(bound) => write!(
                f,
                "Bridge({}/{}, delivered {}, peak {}{})",
                self.queued,
                bound,
                self.delivered,
                self.peak_queued,
                if self.producer_suspended { ", producer suspended" } else { "" }
            ),
            None => write!(
                f,
                "Bridge({}, unbounded, delivered {}, dropped {})",
                self.queued, self.delivered, self.dropped
            ),
        }
    }
}
