pub mod error;
pub mod state_word;
pub mod completion;
pub mod aggregator;
pub mod config;

pub mod pull;
pub mod buffered;
pub mod latest;
pub mod rendezvous;

// Re-export the bridge surface at the crate root
pub use error::{BridgeError, BridgeResult};
pub use state_word::{Backoff, StateGuard, StateLock, StateWord};
pub use completion::{CompletionHandle, CompletionState, HandleKey, HandlePool};
pub use aggregator::ErrorAggregator;
pub use config::{BridgeConfig, CombineConfig, CombineMode, QueueBound};
pub use pull::{into_stream, AsyncPull, BridgeStats};
pub use buffered::{buffer, try_buffer, BridgeState, BufferedBridge, Emitter};
pub use latest::{latest, try_latest, LatestSnapshotBridge, Publisher};
pub use rendezvous::{
    combine_latest,
    try_zip_all,
    zip_all,
    ArrivalMask,
    RendezvousCombinator,
    RendezvousState,
    Source,
};
