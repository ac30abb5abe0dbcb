//! Multi-stream synchronized batching.
//!
//! Producers push items into per-stream ingest channels; a coordinator thread
//! emits one composite batch per cycle once every active channel holds
//! `depth` items, or from whichever channels do when the cycle deadline
//! passes. A pump thread hands batches to the consumer in order.

pub mod app;
pub mod batch;
pub mod channel;
pub mod config;
pub mod item;
pub mod observability;
pub mod runtime;

pub use batch::{ChannelContribution, ChannelMask, CompositeBatch};
pub use channel::{ChannelError, ChannelHandle, ChannelState, IngestChannel, MAX_CHANNELS};
pub use config::{
    ConfigError, ConfigKnob, ConfigKnobClass, CoordinatorConfig, DEFAULT_DURATION,
    MAX_MOVING_WINDOW_SIZE,
};
pub use item::{Item, ItemFlags, SharedItem};
pub use observability::{
    BatchActivity, BatchActivityLog, BatchActivityRecord, CoordinatorMetrics,
    DEFAULT_ACTIVITY_CAPACITY,
};
pub use runtime::{
    BatchCoordinator, BatchCoordinatorBuilder, BatchSink, ChannelSender, ChannelSnapshot,
    CoordinatorPhase, DeliveryError, DiscardSink, EgressError, EgressQueue, EgressSignal,
    PushError, StartError, StopError, EOS_WAIT_INTERVAL,
};
