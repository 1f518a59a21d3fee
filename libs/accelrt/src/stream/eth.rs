// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Streams carried over UDP to a network-attached device.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use parking_lot::Mutex;

use super::{InputStream, OutputStream, StreamBase, StreamBufferMode, StreamCore, impl_stream_core_accessors};
use crate::config::{EthInputStreamParams, EthOutputStreamParams, StreamInterface};
use crate::device::DevicePtr;
use crate::error::{AccelError, Result};
use crate::event::EventPtr;
use crate::metadata::LayerInfo;
use crate::vdma::buffer::DmaAbleBufferPtr;

fn map_socket_error(stream_name: &str, e: io::Error) -> AccelError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            AccelError::Timeout(format!("socket of stream '{}'", stream_name))
        }
        _ => AccelError::Io(e),
    }
}

fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout).filter(|t| !t.is_zero())
}

fn check_payload_size(layer: &LayerInfo, max_payload_size: u16) -> Result<()> {
    if max_payload_size == 0 {
        return Err(AccelError::InvalidArgument(format!(
            "stream '{}' needs a non-zero max payload size",
            layer.name
        )));
    }
    Ok(())
}

/// Socket lifecycle shared by both directions.
struct EthTransport {
    device: DevicePtr,
    host_address: SocketAddr,
    device_address: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
}

impl EthTransport {
    fn activate(&self, core: &StreamCore, batch_size: u16) -> Result<()> {
        core.check_not_aborted()?;
        core.configured_buffer_mode()?;
        let layer = core.layer_info();
        self.device.open_stream(layer, StreamInterface::Eth, batch_size)?;
        match self.open_socket(core.timeout()) {
            Ok(socket) => *self.socket.lock() = Some(socket),
            Err(e) => {
                if let Err(close_err) = self.device.close_stream(layer, StreamInterface::Eth) {
                    tracing::warn!(stream = %layer.name, error = %close_err, "Failed to close eth stream");
                }
                return Err(e);
            }
        }
        core.set_active(true);
        tracing::debug!(stream = %layer.name, device = %self.device_address, batch_size, "Activated eth stream");
        Ok(())
    }

    fn open_socket(&self, timeout: Duration) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(self.host_address)?;
        socket.connect(self.device_address)?;
        socket.set_write_timeout(socket_timeout(timeout))?;
        socket.set_read_timeout(socket_timeout(timeout))?;
        Ok(socket)
    }

    fn deactivate(&self, core: &StreamCore) -> Result<()> {
        core.set_active(false);
        self.socket.lock().take();
        self.device
            .close_stream(core.layer_info(), StreamInterface::Eth)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        match self.socket.lock().as_ref() {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(AccelError::InvalidOperation("eth stream is not active".into())),
        }
    }

    fn with_socket<T>(&self, core: &StreamCore, f: impl FnOnce(&UdpSocket) -> Result<T>) -> Result<T> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or_else(|| {
            AccelError::InvalidOperation(format!(
                "stream '{}' has no socket while inactive",
                core.layer_info().name
            ))
        })?;
        f(socket)
    }
}

pub struct EthInputStream {
    core: StreamCore,
    transport: EthTransport,
    max_payload_size: usize,
    rate_limit_bytes_per_sec: Option<u32>,
}

impl EthInputStream {
    pub fn new(
        device: DevicePtr,
        layer_info: LayerInfo,
        params: EthInputStreamParams,
        activation_event: EventPtr,
    ) -> Result<Self> {
        check_payload_size(&layer_info, params.max_payload_size)?;
        Ok(Self {
            core: StreamCore::new(layer_info, StreamInterface::Eth, activation_event),
            transport: EthTransport {
                device,
                host_address: params.host_address,
                device_address: params.device_address,
                socket: Mutex::new(None),
            },
            max_payload_size: params.max_payload_size as usize,
            rate_limit_bytes_per_sec: params.rate_limit_bytes_per_sec.filter(|&rate| rate > 0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.transport.with_socket(&self.core, |socket| {
            for payload in frame.chunks(self.max_payload_size) {
                socket
                    .send(payload)
                    .map_err(|e| map_socket_error(self.name(), e))?;
                if let Some(rate) = self.rate_limit_bytes_per_sec {
                    std::thread::sleep(Duration::from_secs_f64(payload.len() as f64 / rate as f64));
                }
            }
            Ok(())
        })
    }
}

impl StreamBase for EthInputStream {
    impl_stream_core_accessors!();

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.transport.activate(&self.core, dynamic_batch_size)
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.transport.deactivate(&self.core)
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
            "eth stream '{}' has no frame queue",
            self.name()
        )))
    }
}

impl InputStream for EthInputStream {
    fn write(&self, buffer: &[u8]) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::Owning)?;
        self.core.check_frame_size(buffer.len())?;
        self.core.wait_until_ready()?;
        self.send_frame(buffer)
    }

    fn write_async(&self, buffer: DmaAbleBufferPtr) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::NotOwning)?;
        let mut frame = vec![0u8; self.get_frame_size()];
        buffer.copy_to(&mut frame)?;
        self.core.wait_until_ready()?;
        self.send_frame(&frame)
    }
}

pub struct EthOutputStream {
    core: StreamCore,
    transport: EthTransport,
}

impl EthOutputStream {
    pub fn new(
        device: DevicePtr,
        layer_info: LayerInfo,
        params: EthOutputStreamParams,
        activation_event: EventPtr,
    ) -> Result<Self> {
        check_payload_size(&layer_info, params.max_payload_size)?;
        Ok(Self {
            core: StreamCore::new(layer_info, StreamInterface::Eth, activation_event),
            transport: EthTransport {
                device,
                host_address: params.host_address,
                device_address: params.device_address,
                socket: Mutex::new(None),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Gather datagrams until `unit` is full.
    fn recv_unit(&self, unit: &mut [u8]) -> Result<()> {
        self.transport.with_socket(&self.core, |socket| {
            let mut offset = 0;
            while offset < unit.len() {
                self.core.check_not_aborted()?;
                let received = socket
                    .recv(&mut unit[offset..])
                    .map_err(|e| map_socket_error(self.name(), e))?;
                offset += received;
            }
            Ok(())
        })
    }
}

impl StreamBase for EthOutputStream {
    impl_stream_core_accessors!();

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.transport.activate(&self.core, dynamic_batch_size)
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.transport.deactivate(&self.core)
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
            "eth stream '{}' has no frame queue",
            self.name()
        )))
    }
}

impl OutputStream for EthOutputStream {
    /// Reads one transfer unit: a whole frame, or for detection layers a
    /// single bbox or burst.
    fn read(&self, buffer: &mut [u8]) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::Owning)?;
        self.core.check_transfer_size(buffer.len())?;
        self.core.wait_until_ready()?;
        self.recv_unit(buffer)
    }

    fn read_async(&self, buffer: DmaAbleBufferPtr) -> Result<()> {
        self.core.require_buffer_mode(StreamBufferMode::NotOwning)?;
        let unit_size = self.layer_info().transfer_size();
        if buffer.size() < unit_size {
            return Err(AccelError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than transfer size {}",
                buffer.size(),
                unit_size
            )));
        }
        self.core.wait_until_ready()?;
        let mut unit = vec![0u8; unit_size];
        self.recv_unit(&mut unit)?;
        buffer.copy_from(&unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::event::Event;
    use crate::metadata::StreamDirection;
    use crate::test_support::MockDevice;

    fn eth_device() -> std::sync::Arc<MockDevice> {
        MockDevice::new(DeviceType::Eth, &[StreamInterface::Eth], false)
    }

    #[test]
    fn test_input_frame_split_into_payloads() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let device = eth_device();
        let stream = EthInputStream::new(
            device.clone(),
            LayerInfo::new("net/in", "net", StreamDirection::HostToDevice, 5),
            EthInputStreamParams {
                host_address: "127.0.0.1:0".parse().unwrap(),
                device_address: receiver.local_addr().unwrap(),
                max_payload_size: 3,
                rate_limit_bytes_per_sec: None,
            },
            Event::new_shared(false),
        )
        .unwrap();
        stream.set_buffer_mode(StreamBufferMode::Owning).unwrap();
        stream.activate_stream(3).unwrap();
        assert_eq!(
            *device.opened.lock(),
            vec![("net/in".to_string(), StreamInterface::Eth, 3)]
        );

        stream.write(&[1, 2, 3, 4, 5]).unwrap();
        let mut datagram = [0u8; 16];
        assert_eq!(receiver.recv(&mut datagram).unwrap(), 3);
        assert_eq!(&datagram[..3], &[1, 2, 3]);
        assert_eq!(receiver.recv(&mut datagram).unwrap(), 2);
        assert_eq!(&datagram[..2], &[4, 5]);

        stream.deactivate_stream().unwrap();
        assert!(device.opened.lock().is_empty());
    }

    #[test]
    fn test_output_reassembles_datagrams() {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stream = EthOutputStream::new(
            eth_device(),
            LayerInfo::new("net/out", "net", StreamDirection::DeviceToHost, 4),
            EthOutputStreamParams {
                host_address: "127.0.0.1:0".parse().unwrap(),
                device_address: sender.local_addr().unwrap(),
                max_payload_size: 2,
            },
            Event::new_shared(false),
        )
        .unwrap();
        stream.set_buffer_mode(StreamBufferMode::Owning).unwrap();
        stream.set_timeout(Duration::from_secs(2));
        stream.activate_stream(1).unwrap();

        let target = stream.local_addr().unwrap();
        sender.send_to(&[9, 8], target).unwrap();
        sender.send_to(&[7, 6], target).unwrap();

        let mut frame = [0u8; 4];
        stream.read(&mut frame).unwrap();
        assert_eq!(frame, [9, 8, 7, 6]);
    }

    #[test]
    fn test_zero_payload_size_is_invalid() {
        let result = EthOutputStream::new(
            eth_device(),
            LayerInfo::new("net/out", "net", StreamDirection::DeviceToHost, 4),
            EthOutputStreamParams {
                host_address: "127.0.0.1:0".parse().unwrap(),
                device_address: "127.0.0.1:1".parse().unwrap(),
                max_payload_size: 0,
            },
            Event::new_shared(false),
        );
        assert!(matches!(result, Err(AccelError::InvalidArgument(_))));
    }
}
