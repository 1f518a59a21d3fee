// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! DMA engine plumbing: transferable buffers and boundary channels.

pub mod buffer;
pub mod channel;

pub use buffer::{
    BufferIdentifier, DmaAbleBuffer, DmaAbleBufferPtr, DriverDmaAbleBuffer,
    PageAlignedDmaAbleBuffer, UserAddress, UserDmaAbleBuffer, page_size,
};
pub use channel::{BoundaryChannel, BoundaryChannelPtr};
