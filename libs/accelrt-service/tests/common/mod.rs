// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-process service on an ephemeral loopback port, plus a loopback
//! core-op to publish on it.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use accelrt::device::DriverBuffer;
use accelrt::vdma::{BoundaryChannel, BoundaryChannelPtr, BufferIdentifier, DmaAbleBufferPtr};
use accelrt::{
    AccelError, ActiveCoreOpHolder, ConfigureNetworkParams, CoreOp, CoreOpMetadata, CoreOpPtr,
    DEFAULT_BATCH_SIZE, Device, DeviceType, DmaAllocationKind, DmaDriver, LayerInfo, NetworkParams,
    ResourcesManager, Result, StreamDirection, StreamInterface, StreamParameters,
    SupportedFeatures, VdmaDevice,
};
use accelrt_service::ServiceState;
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub const INPUT: &str = "net/input";
pub const OUTPUT: &str = "net/output";
pub const FRAME_SIZE: usize = 4;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ----- service -----

pub struct TestService {
    pub addr: SocketAddr,
    pub state: ServiceState,
    pub runtime: tokio::runtime::Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestService {
    pub fn start() -> Self {
        init_tracing();
        let state = ServiceState::new();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_state = state.clone();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let handle = runtime.handle().clone();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                ready_tx.send((listener.local_addr().unwrap(), handle)).unwrap();
                accelrt_service::serve_with_listener(server_state, listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
            });
        });

        let (addr, runtime) = ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        Self {
            addr,
            state,
            runtime,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ----- loopback core-op -----

struct LoopbackDriver;

impl DmaDriver for LoopbackDriver {
    fn dma_allocation_kind(&self) -> DmaAllocationKind {
        DmaAllocationKind::UserAllocated
    }

    fn allocate_driver_buffer(&self, _size: usize) -> Result<DriverBuffer> {
        Err(AccelError::NotSupported("loopback driver".into()))
    }

    fn free_driver_buffer(&self, _identifier: BufferIdentifier) -> Result<()> {
        Ok(())
    }
}

struct LoopbackDevice;

impl Device for LoopbackDevice {
    fn device_id(&self) -> String {
        "0000:02:00.0".into()
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Pcie
    }

    fn is_stream_interface_supported(&self, interface: StreamInterface) -> bool {
        interface == StreamInterface::Pcie
    }

    fn default_streams_interface(&self) -> Result<StreamInterface> {
        Ok(StreamInterface::Pcie)
    }

    fn open_stream(&self, _layer: &LayerInfo, _interface: StreamInterface, _batch_size: u16) -> Result<()> {
        Ok(())
    }

    fn close_stream(&self, _layer: &LayerInfo, _interface: StreamInterface) -> Result<()> {
        Ok(())
    }

    fn as_vdma_device(self: Arc<Self>) -> Option<Arc<dyn VdmaDevice>> {
        Some(self)
    }
}

impl VdmaDevice for LoopbackDevice {
    fn driver(&self) -> Arc<dyn DmaDriver> {
        Arc::new(LoopbackDriver)
    }
}

/// Frames written on the input channel are read back on the output one.
pub struct LoopbackChannel {
    direction: StreamDirection,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    aborts: AtomicUsize,
}

impl LoopbackChannel {
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl BoundaryChannel for LoopbackChannel {
    fn channel_id(&self) -> u32 {
        match self.direction {
            StreamDirection::HostToDevice => 0,
            StreamDirection::DeviceToHost => 1,
        }
    }

    fn activate(&self, _transfer_size: usize, _batch_size: u16) -> Result<()> {
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_abort(&self) -> Result<()> {
        Ok(())
    }

    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize, _timeout: Duration) -> Result<()> {
        match self.direction {
            StreamDirection::HostToDevice => {
                let mut frame = vec![0u8; length];
                buffer.copy_to(&mut frame)?;
                self.frames.lock().push(frame);
                Ok(())
            }
            StreamDirection::DeviceToHost => {
                let frame = self
                    .frames
                    .lock()
                    .pop()
                    .ok_or_else(|| AccelError::Timeout("no frame queued".into()))?;
                buffer.copy_from(&frame)
            }
        }
    }

    fn pending_frames_capacity(&self) -> usize {
        4
    }
}

struct LoopbackResources {
    channels: HashMap<String, BoundaryChannelPtr>,
}

impl ResourcesManager for LoopbackResources {
    fn get_boundary_vdma_channel_by_stream_name(&self, stream_name: &str) -> Result<BoundaryChannelPtr> {
        self.channels
            .get(stream_name)
            .cloned()
            .ok_or_else(|| AccelError::NotFound(stream_name.to_string()))
    }
}

pub struct LoopbackCoreOp {
    pub core_op: CoreOpPtr,
    pub input_channel: Arc<LoopbackChannel>,
    pub output_channel: Arc<LoopbackChannel>,
}

/// A single-network core-op `resnet` with one input and one output stream.
pub fn loopback_core_op() -> LoopbackCoreOp {
    let metadata = Arc::new(CoreOpMetadata::new(
        "resnet",
        vec![
            LayerInfo::new(INPUT, "net", StreamDirection::HostToDevice, FRAME_SIZE),
            LayerInfo::new(OUTPUT, "net", StreamDirection::DeviceToHost, FRAME_SIZE),
        ],
        SupportedFeatures::default(),
    ));

    let frames = Arc::new(Mutex::new(Vec::new()));
    let input_channel = Arc::new(LoopbackChannel {
        direction: StreamDirection::HostToDevice,
        frames: frames.clone(),
        aborts: AtomicUsize::new(0),
    });
    let output_channel = Arc::new(LoopbackChannel {
        direction: StreamDirection::DeviceToHost,
        frames,
        aborts: AtomicUsize::new(0),
    });
    let channels: HashMap<String, BoundaryChannelPtr> = HashMap::from([
        (INPUT.to_string(), input_channel.clone() as BoundaryChannelPtr),
        (OUTPUT.to_string(), output_channel.clone() as BoundaryChannelPtr),
    ]);

    let config = ConfigureNetworkParams {
        stream_params_by_name: BTreeMap::from([
            (
                INPUT.to_string(),
                StreamParameters::vdma(StreamInterface::Pcie, StreamDirection::HostToDevice),
            ),
            (
                OUTPUT.to_string(),
                StreamParameters::vdma(StreamInterface::Pcie, StreamDirection::DeviceToHost),
            ),
        ]),
        network_params_by_name: BTreeMap::from([(
            "net".to_string(),
            NetworkParams {
                batch_size: DEFAULT_BATCH_SIZE,
            },
        )]),
        ..Default::default()
    };

    let core_op = CoreOp::new(
        config,
        metadata,
        ActiveCoreOpHolder::new_shared(),
        Some(Arc::new(LoopbackResources { channels })),
    )
    .unwrap();
    core_op
        .create_streams_from_config_params(Arc::new(LoopbackDevice))
        .unwrap();

    LoopbackCoreOp {
        core_op,
        input_channel,
        output_channel,
    }
}
