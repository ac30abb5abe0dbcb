pub mod coordinator;
pub mod egress;

pub use coordinator::{
    BatchCoordinator, BatchCoordinatorBuilder, ChannelSender, ChannelSnapshot, CoordinatorPhase,
    PushError, StartError, StopError, EOS_WAIT_INTERVAL,
};
pub use egress::{BatchSink, DeliveryError, DiscardSink, EgressError, EgressQueue, EgressSignal};
