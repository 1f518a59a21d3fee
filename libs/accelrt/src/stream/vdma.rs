// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{InputStream, OutputStream, StreamBase, StreamBufferMode, StreamCore, impl_stream_core_accessors};
use crate::config::StreamInterface;
use crate::device::VdmaDevice;
use crate::error::{AccelError, Result};
use crate::event::EventPtr;
use crate::latency_meter::LatencyMeterPtr;
use crate::metadata::LayerInfo;
use crate::vdma::buffer::{self, DmaAbleBufferPtr};
use crate::vdma::channel::BoundaryChannelPtr;

/// Bounce buffer and channel shared by both DMA directions.
struct VdmaTransport {
    channel: BoundaryChannelPtr,
    device: Arc<dyn VdmaDevice>,
    bounce_buffer: Mutex<Option<DmaAbleBufferPtr>>,
    /// Held from copy-in through copy-out of an owning-mode transfer.
    transfer_lock: Mutex<()>,
}

impl VdmaTransport {
    fn new(channel: BoundaryChannelPtr, device: Arc<dyn VdmaDevice>) -> Self {
        Self {
            channel,
            device,
            bounce_buffer: Mutex::new(None),
            transfer_lock: Mutex::new(()),
        }
    }

    fn activate(&self, core: &StreamCore, batch_size: u16) -> Result<()> {
        core.check_not_aborted()?;
        let mode = core.configured_buffer_mode()?;
        let size = core.layer_info().transfer_size();
        self.channel.activate(size, batch_size)?;
        if mode == StreamBufferMode::Owning {
            match buffer::create_with_driver(self.device.driver(), size, None) {
                Ok(bounce) => *self.bounce_buffer.lock() = Some(bounce),
                Err(e) => {
                    if let Err(deactivate_err) = self.channel.deactivate() {
                        tracing::warn!(
                            stream = %core.layer_info().name,
                            error = %deactivate_err,
                            "Failed to deactivate channel after buffer allocation failure"
                        );
                    }
                    return Err(e);
                }
            }
        }
        core.set_active(true);
        tracing::debug!(
            stream = %core.layer_info().name,
            channel = self.channel.channel_id(),
            batch_size,
            ?mode,
            "Activated vdma stream"
        );
        Ok(())
    }

    fn deactivate(&self, core: &StreamCore) -> Result<()> {
        core.set_active(false);
        let result = self.channel.deactivate();
        self.bounce_buffer.lock().take();
        result
    }

    fn abort(&self, core: &StreamCore) -> Result<()> {
        core.set_aborted(true);
        self.channel.abort()
    }

    fn clear_abort(&self, core: &StreamCore) -> Result<()> {
        self.channel.clear_abort()?;
        core.set_aborted(false);
        Ok(())
    }

    /// Run `f` with exclusive use of the bounce buffer.
    fn with_bounce_buffer<T>(
        &self,
        core: &StreamCore,
        f: impl FnOnce(&DmaAbleBufferPtr) -> Result<T>,
    ) -> Result<T> {
        let _transfer = self.transfer_lock.lock();
        let bounce = self.bounce_buffer.lock().clone().ok_or_else(|| {
            AccelError::InvalidOperation(format!(
                "stream '{}' has no transfer buffer while inactive",
                core.layer_info().name
            ))
        })?;
        f(&bounce)
    }
}

pub struct VdmaInputStream {
    core: StreamCore,
    transport: VdmaTransport,
    latency_meter: Option<LatencyMeterPtr>,
}

impl VdmaInputStream {
    pub fn new(
        device: Arc<dyn VdmaDevice>,
        channel: BoundaryChannelPtr,
        layer_info: LayerInfo,
        interface: StreamInterface,
        activation_event: EventPtr,
        latency_meter: Option<LatencyMeterPtr>,
    ) -> Self {
        Self {
            core: StreamCore::new(layer_info, interface, activation_event),
            transport: VdmaTransport::new(channel, device),
            latency_meter,
        }
    }

    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize) -> Result<()> {
        if let Some(meter) = &self.latency_meter {
            meter.add_start_sample(Instant::now());
        }
        self.transport
            .channel
            .transfer(buffer, length, self.core.timeout())
    }
}

impl StreamBase for VdmaInputStream {
    impl_stream_core_accessors!();

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.transport.activate(&self.core, dynamic_batch_size)
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.transport.deactivate(&self.core)
    }

    fn abort(&self) -> Result<()> {
        self.transport.abort(&self.core)
    }

    fn clear_abort(&self) -> Result<()> {
        self.transport.clear_abort(&self.core)
    }

    fn get_buffer_frames_size(&self) -> Result<usize> {
        Ok(self.transport.channel.pending_frames_capacity())
    }
}

impl InputStream for VdmaInputStream {
    fn write(&self, buffer: &[u8]) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::Owning)?;
        self.core.check_frame_size(buffer.len())?;
        self.core.wait_until_ready()?;
        self.transport.with_bounce_buffer(&self.core, |bounce| {
            bounce.copy_from(buffer)?;
            self.transfer(bounce, buffer.len())
        })
    }

    fn write_async(&self, buffer: DmaAbleBufferPtr) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::NotOwning)?;
        let frame_size = self.get_frame_size();
        if buffer.size() < frame_size {
            return Err(AccelError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than frame size {}",
                buffer.size(),
                frame_size
            )));
        }
        self.core.wait_until_ready()?;
        self.transfer(&buffer, frame_size)
    }
}

pub struct VdmaOutputStream {
    core: StreamCore,
    transport: VdmaTransport,
    latency_meter: Option<LatencyMeterPtr>,
}

impl VdmaOutputStream {
    pub fn new(
        device: Arc<dyn VdmaDevice>,
        channel: BoundaryChannelPtr,
        layer_info: LayerInfo,
        interface: StreamInterface,
        activation_event: EventPtr,
        latency_meter: Option<LatencyMeterPtr>,
    ) -> Self {
        Self {
            core: StreamCore::new(layer_info, interface, activation_event),
            transport: VdmaTransport::new(channel, device),
            latency_meter,
        }
    }

    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize) -> Result<()> {
        self.transport
            .channel
            .transfer(buffer, length, self.core.timeout())?;
        if let Some(meter) = &self.latency_meter {
            meter.add_end_sample(self.name(), Instant::now());
        }
        Ok(())
    }
}

impl StreamBase for VdmaOutputStream {
    impl_stream_core_accessors!();

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.transport.activate(&self.core, dynamic_batch_size)
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.transport.deactivate(&self.core)
    }

    fn abort(&self) -> Result<()> {
        self.transport.abort(&self.core)
    }

    fn clear_abort(&self) -> Result<()> {
        self.transport.clear_abort(&self.core)
    }

    fn get_buffer_frames_size(&self) -> Result<usize> {
        Ok(self.transport.channel.pending_frames_capacity())
    }
}

impl OutputStream for VdmaOutputStream {
    /// Reads one transfer unit: a whole frame, or for detection layers a
    /// single bbox or burst.
    fn read(&self, buffer: &mut [u8]) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::Owning)?;
        self.core.check_transfer_size(buffer.len())?;
        self.core.wait_until_ready()?;
        self.transport.with_bounce_buffer(&self.core, |bounce| {
            self.transfer(bounce, buffer.len())?;
            bounce.copy_to(buffer)
        })
    }

    fn read_async(&self, buffer: DmaAbleBufferPtr) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::NotOwning)?;
        let unit = self.layer_info().transfer_size();
        if buffer.size() < unit {
            return Err(AccelError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than transfer size {}",
                buffer.size(),
                unit
            )));
        }
        self.core.wait_until_ready()?;
        self.transfer(&buffer, unit)
    }
}
