// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use crate::error::Result;
use crate::vdma::channel::BoundaryChannelPtr;

pub type ResourcesManagerPtr = Arc<dyn ResourcesManager>;

/// Owner of the device-side channels and buffers allocated for a core-op.
pub trait ResourcesManager: Send + Sync {
    /// Pre-allocated boundary channel for a stream, or `NotFound`.
    fn get_boundary_vdma_channel_by_stream_name(&self, stream_name: &str)
        -> Result<BoundaryChannelPtr>;
}
