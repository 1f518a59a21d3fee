// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! accelrt - host runtime core for a neural-network accelerator.
//!
//! Activates configured workloads ("core-ops") on a device and wires their
//! layer streams across DMA, network and camera transports.

pub mod accumulator;
pub mod active_core_op_holder;
pub mod config;
pub mod core_op;
pub mod device;
pub mod error;
pub mod event;
pub mod latency_meter;
pub mod metadata;
pub mod resource_manager;
pub mod stream;
pub mod vdma;
pub mod vstream;

#[cfg(test)]
mod test_support;

pub use accumulator::{AccumulatorPtr, AccumulatorResults, FullAccumulator};
pub use active_core_op_holder::{ActiveCoreOpHolder, ActiveCoreOpHolderPtr};
pub use config::{
    ConfigureNetworkParams, DEFAULT_ACTUAL_BATCH_SIZE, DEFAULT_BATCH_SIZE,
    DEFAULT_VSTREAM_TIMEOUT_MS, LatencyMeasurementFlags, MAX_ACTIVE_TRANSFERS_SCALE,
    NetworkParams, StreamFlags, StreamInterface, StreamParameters, TransportParams,
};
pub use core_op::{
    ActivatedCoreOp, CoreOp, CoreOpId, CoreOpPtr, CoreOpState, LatencyMeasurementResult,
    SchedulerParams,
};
pub use device::{Device, DevicePtr, DeviceType, DmaAllocationKind, DmaDriver, VdmaDevice};
pub use error::{AccelError, Result, Status};
pub use event::{Event, EventPtr};
pub use metadata::{
    CoreOpMetadata, CoreOpMetadataPtr, LayerInfo, NetworkInfo, StreamDirection, StreamInfo,
    SupportedFeatures,
};
pub use resource_manager::{ResourcesManager, ResourcesManagerPtr};
pub use stream::{
    InputStream, InputStreamPtr, OutputStream, OutputStreamPtr, StreamBase, StreamBufferMode,
};
pub use vstream::{InputVStream, OutputVStream, VStreamInfo, VStreamParams};

/// Library version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
