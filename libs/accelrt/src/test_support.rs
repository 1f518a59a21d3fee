// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-memory device, driver, channel and resources manager for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{MipiInputStreamParams, StreamInterface};
use crate::device::{Device, DeviceType, DmaAllocationKind, DmaDriver, DriverBuffer, VdmaDevice};
use crate::error::{AccelError, Result};
use crate::metadata::LayerInfo;
use crate::resource_manager::ResourcesManager;
use crate::vdma::buffer::{BufferIdentifier, DmaAbleBufferPtr};
use crate::vdma::channel::{BoundaryChannel, BoundaryChannelPtr};

pub(crate) struct MockDriver;

impl DmaDriver for MockDriver {
    fn dma_allocation_kind(&self) -> DmaAllocationKind {
        DmaAllocationKind::UserAllocated
    }

    fn allocate_driver_buffer(&self, _size: usize) -> Result<DriverBuffer> {
        Err(AccelError::NotSupported("mock driver".into()))
    }

    fn free_driver_buffer(&self, _identifier: BufferIdentifier) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct MockDevice {
    device_type: DeviceType,
    supported: HashSet<StreamInterface>,
    vdma_capable: bool,
    pub(crate) opened: Mutex<Vec<(String, StreamInterface, u16)>>,
    pub(crate) mipi_configured: Mutex<Vec<String>>,
}

impl MockDevice {
    pub(crate) fn new(
        device_type: DeviceType,
        supported: &[StreamInterface],
        vdma_capable: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_type,
            supported: supported.iter().copied().collect(),
            vdma_capable,
            opened: Mutex::new(Vec::new()),
            mipi_configured: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pcie() -> Arc<Self> {
        Self::new(DeviceType::Pcie, &[StreamInterface::Pcie], true)
    }
}

impl Device for MockDevice {
    fn device_id(&self) -> String {
        format!("mock-{}", self.device_type)
    }

    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn is_stream_interface_supported(&self, interface: StreamInterface) -> bool {
        self.supported.contains(&interface)
    }

    fn default_streams_interface(&self) -> Result<StreamInterface> {
        Ok(match self.device_type {
            DeviceType::Pcie => StreamInterface::Pcie,
            DeviceType::Integrated => StreamInterface::Integrated,
            DeviceType::Eth => StreamInterface::Eth,
        })
    }

    fn open_stream(&self, layer: &LayerInfo, interface: StreamInterface, batch_size: u16) -> Result<()> {
        self.opened.lock().push((layer.name.clone(), interface, batch_size));
        Ok(())
    }

    fn close_stream(&self, layer: &LayerInfo, _interface: StreamInterface) -> Result<()> {
        self.opened.lock().retain(|(name, _, _)| name != &layer.name);
        Ok(())
    }

    fn configure_mipi_input(&self, layer: &LayerInfo, _params: &MipiInputStreamParams) -> Result<()> {
        self.mipi_configured.lock().push(layer.name.clone());
        Ok(())
    }

    fn as_vdma_device(self: Arc<Self>) -> Option<Arc<dyn VdmaDevice>> {
        if self.vdma_capable { Some(self) } else { None }
    }
}

impl VdmaDevice for MockDevice {
    fn driver(&self) -> Arc<dyn DmaDriver> {
        Arc::new(MockDriver)
    }
}

#[derive(Default)]
struct MockChannelState {
    activated_transfer_size: Option<usize>,
    activated_batch_size: Option<u16>,
    aborted: bool,
    fail_deactivate: bool,
    written: Vec<Vec<u8>>,
    incoming: VecDeque<Vec<u8>>,
}

pub(crate) struct MockChannel {
    id: u32,
    state: Mutex<MockChannelState>,
}

impl MockChannel {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(MockChannelState::default()),
        })
    }

    pub(crate) fn activated_transfer_size(&self) -> Option<usize> {
        self.state.lock().activated_transfer_size
    }

    pub(crate) fn activated_batch_size(&self) -> Option<u16> {
        self.state.lock().activated_batch_size
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub(crate) fn push_incoming(&self, data: Vec<u8>) {
        self.state.lock().incoming.push_back(data);
    }

    pub(crate) fn fail_deactivate(&self) {
        self.state.lock().fail_deactivate = true;
    }
}

impl BoundaryChannel for MockChannel {
    fn channel_id(&self) -> u32 {
        self.id
    }

    fn activate(&self, transfer_size: usize, batch_size: u16) -> Result<()> {
        let mut state = self.state.lock();
        state.activated_transfer_size = Some(transfer_size);
        state.activated_batch_size = Some(batch_size);
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.activated_transfer_size = None;
        state.activated_batch_size = None;
        if state.fail_deactivate {
            return Err(AccelError::InternalFailure(format!(
                "channel {} failed to stop",
                self.id
            )));
        }
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.state.lock().aborted = true;
        Ok(())
    }

    fn clear_abort(&self) -> Result<()> {
        self.state.lock().aborted = false;
        Ok(())
    }

    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(AccelError::AbortedByUser(format!("channel {}", self.id)));
        }
        if state.activated_transfer_size.is_none() {
            return Err(AccelError::InvalidOperation(format!(
                "channel {} is not active",
                self.id
            )));
        }
        if let Some(data) = state.incoming.pop_front() {
            let length = length.min(data.len());
            buffer.copy_from(&data[..length])
        } else {
            let mut data = vec![0u8; length];
            buffer.copy_to(&mut data)?;
            state.written.push(data);
            Ok(())
        }
    }

    fn pending_frames_capacity(&self) -> usize {
        16
    }
}

#[derive(Default)]
pub(crate) struct MockResourcesManager {
    channels: Mutex<HashMap<String, Arc<MockChannel>>>,
}

impl MockResourcesManager {
    /// One channel per stream name, ids in the given order.
    pub(crate) fn with_streams(names: &[&str]) -> Arc<Self> {
        let manager = Self::default();
        {
            let mut channels = manager.channels.lock();
            for (id, name) in names.iter().enumerate() {
                channels.insert(name.to_string(), MockChannel::new(id as u32));
            }
        }
        Arc::new(manager)
    }

    pub(crate) fn channel(&self, name: &str) -> Arc<MockChannel> {
        self.channels.lock()[name].clone()
    }
}

impl ResourcesManager for MockResourcesManager {
    fn get_boundary_vdma_channel_by_stream_name(
        &self,
        stream_name: &str,
    ) -> Result<BoundaryChannelPtr> {
        self.channels
            .lock()
            .get(stream_name)
            .map(|channel| channel.clone() as BoundaryChannelPtr)
            .ok_or_else(|| AccelError::NotFound(format!("channel for stream '{}'", stream_name)))
    }
}
