// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Raw input/output streams, one per model layer.
//!
//! Every stream is backed by exactly one transport:
//!
//! * [`VdmaInputStream`] / [`VdmaOutputStream`]: boundary DMA channel on the local bus
//! * [`EthInputStream`] / [`EthOutputStream`]: UDP sockets to a network device
//! * [`MipiInputStream`]: camera interface, data never passes through the host
//!
//! [`NmsOutputStream`] wraps an output stream of a detection layer and turns
//! bbox-level reads into whole-frame reads.

mod eth;
mod mipi;
mod nms;
mod vdma;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{DEFAULT_VSTREAM_TIMEOUT_MS, StreamInterface};
use crate::error::{AccelError, Result};
use crate::event::EventPtr;
use crate::metadata::{LayerInfo, StreamDirection};
use crate::vdma::buffer::DmaAbleBufferPtr;

pub use eth::{EthInputStream, EthOutputStream};
pub use mipi::MipiInputStream;
pub use nms::NmsOutputStream;
pub use vdma::{VdmaInputStream, VdmaOutputStream};

pub type InputStreamPtr = Arc<dyn InputStream>;
pub type OutputStreamPtr = Arc<dyn OutputStream>;

/// Who owns the memory a transfer goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufferMode {
    /// The stream allocates and manages its own transfer buffers.
    Owning,
    /// The caller supplies a buffer per transfer and keeps it alive until
    /// the transfer returns.
    NotOwning,
}

pub trait StreamBase: Send + Sync {
    fn layer_info(&self) -> &LayerInfo;

    fn interface(&self) -> StreamInterface;

    fn name(&self) -> &str {
        &self.layer_info().name
    }

    fn network_name(&self) -> &str {
        &self.layer_info().network_name
    }

    fn direction(&self) -> StreamDirection {
        self.layer_info().direction
    }

    fn get_frame_size(&self) -> usize {
        self.layer_info().frame_size
    }

    /// Start the transport with queues sized for `dynamic_batch_size`
    /// frames, already resolved by the owning core-op.
    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()>;

    fn deactivate_stream(&self) -> Result<()>;

    fn is_active(&self) -> bool;

    fn abort(&self) -> Result<()>;

    fn clear_abort(&self) -> Result<()>;

    fn is_aborted(&self) -> bool;

    /// Can be set once; setting a different mode later is an error.
    fn set_buffer_mode(&self, mode: StreamBufferMode) -> Result<()>;

    fn buffer_mode(&self) -> Option<StreamBufferMode>;

    fn set_timeout(&self, timeout: Duration);

    fn get_timeout(&self) -> Duration;

    /// Number of frames the stream can have queued.
    fn get_buffer_frames_size(&self) -> Result<usize>;
}

pub trait InputStream: StreamBase {
    /// Send one frame from host memory. Owning mode only.
    fn write(&self, buffer: &[u8]) -> Result<()>;

    /// Send one frame straight from a caller-owned DMA-able buffer. Not-owning mode only.
    fn write_async(&self, buffer: DmaAbleBufferPtr) -> Result<()>;
}

pub trait OutputStream: StreamBase {
    /// Receive one frame into host memory. Owning mode only.
    fn read(&self, buffer: &mut [u8]) -> Result<()>;

    /// Receive one frame into a caller-owned DMA-able buffer. Not-owning mode only.
    fn read_async(&self, buffer: DmaAbleBufferPtr) -> Result<()>;
}

#[derive(Debug)]
struct StreamCoreState {
    buffer_mode: Option<StreamBufferMode>,
    timeout: Duration,
    active: bool,
}

/// State shared by every transport: layer, activation, abort and buffer mode.
#[derive(Debug)]
pub(crate) struct StreamCore {
    layer_info: LayerInfo,
    interface: StreamInterface,
    activation_event: EventPtr,
    aborted: AtomicBool,
    state: Mutex<StreamCoreState>,
}

impl StreamCore {
    pub(crate) fn new(
        layer_info: LayerInfo,
        interface: StreamInterface,
        activation_event: EventPtr,
    ) -> Self {
        Self {
            layer_info,
            interface,
            activation_event,
            aborted: AtomicBool::new(false),
            state: Mutex::new(StreamCoreState {
                buffer_mode: None,
                timeout: Duration::from_millis(DEFAULT_VSTREAM_TIMEOUT_MS),
                active: false,
            }),
        }
    }

    pub(crate) fn layer_info(&self) -> &LayerInfo {
        &self.layer_info
    }

    pub(crate) fn interface(&self) -> StreamInterface {
        self.interface
    }

    pub(crate) fn set_buffer_mode(&self, mode: StreamBufferMode) -> Result<()> {
        let mut state = self.state.lock();
        match state.buffer_mode {
            Some(current) if current != mode => Err(AccelError::InvalidOperation(format!(
                "stream '{}' already uses {:?} buffer mode",
                self.layer_info.name, current
            ))),
            _ => {
                state.buffer_mode = Some(mode);
                Ok(())
            }
        }
    }

    pub(crate) fn buffer_mode(&self) -> Option<StreamBufferMode> {
        self.state.lock().buffer_mode
    }

    /// Buffer mode the stream was configured with; activation needs one.
    pub(crate) fn configured_buffer_mode(&self) -> Result<StreamBufferMode> {
        self.buffer_mode().ok_or_else(|| {
            AccelError::InvalidOperation(format!(
                "buffer mode of stream '{}' was never set",
                self.layer_info.name
            ))
        })
    }

    pub(crate) fn require_buffer_mode(&self, expected: StreamBufferMode) -> Result<()> {
        match self.buffer_mode() {
            Some(mode) if mode == expected => Ok(()),
            mode => Err(AccelError::InvalidOperation(format!(
                "stream '{}' is in {:?} buffer mode, operation requires {:?}",
                self.layer_info.name, mode, expected
            ))),
        }
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.state.lock().timeout = timeout;
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn set_aborted(&self, aborted: bool) {
        self.aborted.store(aborted, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn check_not_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(AccelError::AbortedByUser(format!(
                "stream '{}' was aborted",
                self.layer_info.name
            )));
        }
        Ok(())
    }

    /// Block until the owning core-op is activated, bounded by the stream timeout.
    pub(crate) fn wait_until_ready(&self) -> Result<()> {
        self.check_not_aborted()?;
        if !self.is_active() {
            let timeout = self.timeout();
            self.activation_event.wait(timeout).map_err(|_| {
                AccelError::Timeout(format!(
                    "stream '{}' was not activated within {} ms",
                    self.layer_info.name,
                    timeout.as_millis()
                ))
            })?;
        }
        self.check_not_aborted()
    }

    pub(crate) fn check_frame_size(&self, length: usize) -> Result<()> {
        if length != self.layer_info.frame_size {
            return Err(AccelError::InvalidArgument(format!(
                "stream '{}' transfers {} byte frames, got {} bytes",
                self.layer_info.name, self.layer_info.frame_size, length
            )));
        }
        Ok(())
    }

    pub(crate) fn check_transfer_size(&self, length: usize) -> Result<()> {
        let unit = self.layer_info.transfer_size();
        if length != unit {
            return Err(AccelError::InvalidArgument(format!(
                "stream '{}' reads {} bytes per transfer, got {} bytes",
                self.layer_info.name, unit, length
            )));
        }
        Ok(())
    }
}

/// Implements the [`StreamBase`] accessors backed by a `core: StreamCore` field.
macro_rules! impl_stream_core_accessors {
    () => {
        fn layer_info(&self) -> &$crate::metadata::LayerInfo {
            self.core.layer_info()
        }

        fn interface(&self) -> $crate::config::StreamInterface {
            self.core.interface()
        }

        fn is_active(&self) -> bool {
            self.core.is_active()
        }

        fn is_aborted(&self) -> bool {
            self.core.is_aborted()
        }

        fn set_buffer_mode(&self, mode: $crate::stream::StreamBufferMode) -> $crate::error::Result<()> {
            self.core.set_buffer_mode(mode)
        }

        fn buffer_mode(&self) -> Option<$crate::stream::StreamBufferMode> {
            self.core.buffer_mode()
        }

        fn set_timeout(&self, timeout: std::time::Duration) {
            self.core.set_timeout(timeout)
        }

        fn get_timeout(&self) -> std::time::Duration {
            self.core.timeout()
        }
    };
}
pub(crate) use impl_stream_core_accessors;
