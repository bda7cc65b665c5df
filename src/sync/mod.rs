pub mod barrier_builder;
pub mod cancel;
pub mod recording;
pub mod state;

#[cfg(feature = "vulkan")]
pub use barrier_builder::BarrierBuilder;
pub use barrier_builder::{
    BarrierSequenceBuilder, BarrierStep, BarrierTarget, OwnershipTransfer, QueueEndpoint,
    ScheduledStep, TransferDescriptor, TransferStep, TransferTarget,
};
pub use cancel::CancelToken;
pub use recording::{RecordingContext, RecordingToken};
pub use state::{Access, ImageLayout, ResState, Stage};
