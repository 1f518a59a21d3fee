// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device-side collaborators consumed by the core-op.
//!
//! Concrete devices (PCIe, integrated, Ethernet) live in the transport
//! drivers; the runtime only sees these traits.

use std::fmt;
use std::sync::Arc;

use crate::config::{MipiInputStreamParams, StreamInterface};
use crate::error::{AccelError, Result};
use crate::metadata::LayerInfo;
use crate::vdma::buffer::{BufferIdentifier, UserAddress};

pub type DevicePtr = Arc<dyn Device>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Pcie,
    Integrated,
    Eth,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcie => write!(f, "pcie"),
            Self::Integrated => write!(f, "integrated"),
            Self::Eth => write!(f, "eth"),
        }
    }
}

pub trait Device: Send + Sync {
    fn device_id(&self) -> String;

    fn device_type(&self) -> DeviceType;

    fn is_stream_interface_supported(&self, interface: StreamInterface) -> bool;

    fn default_streams_interface(&self) -> Result<StreamInterface>;

    /// Enable the device side of a non-DMA stream, queueing up to
    /// `batch_size` frames.
    fn open_stream(&self, layer: &LayerInfo, interface: StreamInterface, batch_size: u16) -> Result<()>;

    fn close_stream(&self, layer: &LayerInfo, interface: StreamInterface) -> Result<()>;

    fn configure_mipi_input(&self, layer: &LayerInfo, _params: &MipiInputStreamParams) -> Result<()> {
        Err(AccelError::NotSupported(format!(
            "device {} has no camera interface for '{}'",
            self.device_id(),
            layer.name
        )))
    }

    /// DMA capable view of this device, if it has one.
    fn as_vdma_device(self: Arc<Self>) -> Option<Arc<dyn VdmaDevice>> {
        None
    }
}

/// Device with DMA engines on the local bus.
pub trait VdmaDevice: Device {
    fn driver(&self) -> Arc<dyn DmaDriver>;
}

/// How a platform obtains memory the DMA engine can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaAllocationKind {
    /// Plain page-aligned allocations are DMA safe.
    UserAllocated,
    /// Memory must come from the kernel driver (e.g. low memory only).
    DriverAllocated,
    /// Memory is shared with an isolated process by handle.
    SharedMemory,
}

/// Region handed out by the kernel driver and mapped into this process.
#[derive(Debug, Clone, Copy)]
pub struct DriverBuffer {
    pub identifier: BufferIdentifier,
    pub address: UserAddress,
}

pub trait DmaDriver: Send + Sync {
    fn dma_allocation_kind(&self) -> DmaAllocationKind;

    fn allocate_driver_buffer(&self, size: usize) -> Result<DriverBuffer>;

    fn free_driver_buffer(&self, identifier: BufferIdentifier) -> Result<()>;
}
