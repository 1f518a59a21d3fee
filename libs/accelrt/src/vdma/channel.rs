// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::vdma::buffer::DmaAbleBufferPtr;

pub type BoundaryChannelPtr = Arc<dyn BoundaryChannel>;

/// DMA channel connecting one host-side stream to the device.
///
/// Allocated up front by the resources manager. The direction is fixed by
/// the channel: a transfer either drains the buffer to the device or fills
/// it from the device.
pub trait BoundaryChannel: Send + Sync {
    fn channel_id(&self) -> u32;

    /// Start accepting transfers of `transfer_size` bytes, with descriptors
    /// for `batch_size` transfers in flight.
    fn activate(&self, transfer_size: usize, batch_size: u16) -> Result<()>;

    fn deactivate(&self) -> Result<()>;

    /// Fail pending and future transfers with `AbortedByUser`.
    fn abort(&self) -> Result<()>;

    fn clear_abort(&self) -> Result<()>;

    /// Blocking transfer of the first `length` bytes of `buffer`.
    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize, timeout: Duration) -> Result<()>;

    /// Frames that may be queued on the channel at once.
    fn pending_frames_capacity(&self) -> usize;
}
