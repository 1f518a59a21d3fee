// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use super::{InputStream, StreamBase, StreamCore, impl_stream_core_accessors};
use crate::config::{MipiInputStreamParams, StreamInterface};
use crate::device::DevicePtr;
use crate::error::{AccelError, Result};
use crate::event::EventPtr;
use crate::metadata::LayerInfo;
use crate::vdma::buffer::DmaAbleBufferPtr;

/// Camera-fed input. Frames go from the sensor to the device directly, so
/// the host can only start and stop the stream.
pub struct MipiInputStream {
    core: StreamCore,
    device: DevicePtr,
    params: MipiInputStreamParams,
}

impl MipiInputStream {
    pub fn new(
        device: DevicePtr,
        layer_info: LayerInfo,
        params: MipiInputStreamParams,
        activation_event: EventPtr,
    ) -> Self {
        Self {
            core: StreamCore::new(layer_info, StreamInterface::Mipi, activation_event),
            device,
            params,
        }
    }

    pub fn params(&self) -> &MipiInputStreamParams {
        &self.params
    }

    fn host_writes_unsupported(&self) -> AccelError {
        AccelError::NotSupported(format!(
            "stream '{}' is fed by the camera interface, host writes are not possible",
            self.name()
        ))
    }
}

impl StreamBase for MipiInputStream {
    impl_stream_core_accessors!();

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.core.check_not_aborted()?;
        let layer = self.core.layer_info();
        self.device.configure_mipi_input(layer, &self.params)?;
        self.device
            .open_stream(layer, StreamInterface::Mipi, dynamic_batch_size)?;
        self.core.set_active(true);
        tracing::debug!(
            stream = %layer.name,
            lanes = self.params.number_of_lanes,
            virtual_channel = self.params.virtual_channel_index,
            batch_size = dynamic_batch_size,
            "Activated mipi stream"
        );
        Ok(())
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.core.set_active(false);
        self.device
            .close_stream(self.core.layer_info(), StreamInterface::Mipi)
    }

    fn abort(&self) -> Result<()> {
        self.core.set_aborted(true);
        Ok(())
    }

    fn clear_abort(&self) -> Result<()> {
        self.core.set_aborted(false);
        Ok(())
    }

    fn get_buffer_frames_size(&self) -> Result<usize> {
        Err(AccelError::NotAvailable(format!(
            "mipi stream '{}' has no host frame queue",
            self.name()
        )))
    }
}

impl InputStream for MipiInputStream {
    fn write(&self, _buffer: &[u8]) -> Result<()> {
        Err(self.host_writes_unsupported())
    }

    fn write_async(&self, _buffer: DmaAbleBufferPtr) -> Result<()> {
        Err(self.host_writes_unsupported())
    }
}
