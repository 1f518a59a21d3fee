// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end core-op lifecycle against an in-memory device.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use accelrt::device::DriverBuffer;
use accelrt::vdma::{BoundaryChannel, BoundaryChannelPtr, BufferIdentifier, DmaAbleBufferPtr};
use accelrt::{
    AccelError, ActiveCoreOpHolder, ConfigureNetworkParams, CoreOp, CoreOpMetadata, CoreOpState,
    DEFAULT_BATCH_SIZE, Device, DeviceType, DmaAllocationKind, DmaDriver, LayerInfo, NetworkParams,
    ResourcesManager, Result, StreamDirection, StreamInterface, StreamParameters,
    SupportedFeatures, VStreamParams, VdmaDevice,
};
use parking_lot::Mutex;

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

struct LoopbackDevice {
    interfaces: Vec<StreamInterface>,
}

impl Device for LoopbackDevice {
    fn device_id(&self) -> String {
        "0000:01:00.0".into()
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Pcie
    }

    fn is_stream_interface_supported(&self, interface: StreamInterface) -> bool {
        self.interfaces.contains(&interface)
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

/// Every frame written to any input comes back on every output read.
#[derive(Default)]
struct LoopbackChannel {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    direction: Option<StreamDirection>,
    active: Mutex<bool>,
}

impl BoundaryChannel for LoopbackChannel {
    fn channel_id(&self) -> u32 {
        0
    }

    fn activate(&self, _transfer_size: usize, _batch_size: u16) -> Result<()> {
        *self.active.lock() = true;
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        *self.active.lock() = false;
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        Ok(())
    }

    fn clear_abort(&self) -> Result<()> {
        Ok(())
    }

    fn transfer(&self, buffer: &DmaAbleBufferPtr, length: usize, _timeout: Duration) -> Result<()> {
        if !*self.active.lock() {
            return Err(AccelError::InvalidOperation("channel is not active".into()));
        }
        match self.direction {
            Some(StreamDirection::HostToDevice) => {
                let mut frame = vec![0u8; length];
                buffer.copy_to(&mut frame)?;
                self.frames.lock().push(frame);
                Ok(())
            }
            _ => {
                let frame = self
                    .frames
                    .lock()
                    .pop()
                    .ok_or_else(|| AccelError::Timeout("no frame".into()))?;
                buffer.copy_from(&frame[..length.min(frame.len())])
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

const LAYERS: [(&str, &str, StreamDirection); 3] = [
    ("net_a/input", "net_a", StreamDirection::HostToDevice),
    ("net_a/output", "net_a", StreamDirection::DeviceToHost),
    ("net_b/output", "net_b", StreamDirection::DeviceToHost),
];

fn build(interface: StreamInterface) -> (Arc<CoreOp>, Arc<ActiveCoreOpHolder>) {
    let metadata = Arc::new(CoreOpMetadata::new(
        "resnet",
        LAYERS
            .iter()
            .map(|(name, network, direction)| LayerInfo::new(*name, *network, *direction, 8))
            .chain(std::iter::once(LayerInfo::new(
                "net_c/output",
                "net_c",
                StreamDirection::DeviceToHost,
                8,
            )))
            .collect(),
        SupportedFeatures::default(),
    ));

    let frames = Arc::new(Mutex::new(Vec::new()));
    let channels = LAYERS
        .iter()
        .map(|(name, _, direction)| {
            let channel: BoundaryChannelPtr = Arc::new(LoopbackChannel {
                frames: frames.clone(),
                direction: Some(*direction),
                active: Mutex::new(false),
            });
            (name.to_string(), channel)
        })
        .collect();

    let mut config = ConfigureNetworkParams::default();
    for (network, batch_size) in [("net_a", 4), ("net_c", 8), ("net_b", DEFAULT_BATCH_SIZE)] {
        config
            .network_params_by_name
            .insert(network.to_string(), NetworkParams { batch_size });
    }
    for (name, _, direction) in LAYERS {
        config
            .stream_params_by_name
            .insert(name.to_string(), StreamParameters::vdma(interface, direction));
    }

    let holder = ActiveCoreOpHolder::new_shared();
    let core_op = CoreOp::new(
        config,
        metadata,
        holder.clone(),
        Some(Arc::new(LoopbackResources { channels })),
    )
    .unwrap();
    (core_op, holder)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pcie_device() -> Arc<LoopbackDevice> {
    Arc::new(LoopbackDevice {
        interfaces: vec![StreamInterface::Pcie],
    })
}

#[test]
fn test_activation_round_trip() {
    init_tracing();
    let (core_op, holder) = build(StreamInterface::Pcie);
    assert_eq!(core_op.min_configured_batch_size(), 4);
    core_op.create_streams_from_config_params(pcie_device()).unwrap();

    core_op.activate(DEFAULT_BATCH_SIZE).unwrap();
    assert_eq!(core_op.state(), CoreOpState::Active);
    assert_eq!(holder.active_id(), Some(core_op.id()));
    let activation = core_op.get_activation_time_accumulator().get();
    assert_eq!(activation.count, 1);
    assert!(activation.min.unwrap() >= 0.0);
    core_op.wait_for_activation(Duration::ZERO).unwrap();

    core_op.deactivate().unwrap();
    assert!(!holder.is_any_active());
    let err = core_op
        .wait_for_activation(Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, AccelError::Timeout(_)));
}

#[test]
fn test_frames_flow_through_vstreams() {
    init_tracing();
    let (core_op, _holder) = build(StreamInterface::Pcie);
    core_op.create_streams_from_config_params(pcie_device()).unwrap();

    let params: BTreeMap<String, VStreamParams> =
        [("net_a/input".to_string(), VStreamParams::default())].into();
    let inputs = core_op.create_input_vstreams(&params).unwrap();
    let params: BTreeMap<String, VStreamParams> =
        [("net_a/output".to_string(), VStreamParams::default())].into();
    let outputs = core_op.create_output_vstreams(&params).unwrap();

    let _active = core_op.activate_with_guard(DEFAULT_BATCH_SIZE).unwrap();
    inputs[0].write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let mut frame = [0u8; 8];
    outputs[0].read(&mut frame).unwrap();
    assert_eq!(frame, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(outputs[0].info().network_name, "net_a");
}

#[test]
fn test_unsupported_interface_is_rejected() {
    let (core_op, _holder) = build(StreamInterface::Integrated);
    let err = core_op
        .create_streams_from_config_params(pcie_device())
        .unwrap_err();
    assert!(matches!(err, AccelError::InvalidOperation(_)));
    assert!(core_op.get_input_streams().is_empty());
    assert!(core_op.get_output_streams().is_empty());
}

#[test]
fn test_concurrent_vstream_writers_keep_frames_whole() {
    const FRAMES: usize = 200;
    init_tracing();
    let (core_op, _holder) = build(StreamInterface::Pcie);
    core_op.create_streams_from_config_params(pcie_device()).unwrap();

    let params: BTreeMap<String, VStreamParams> =
        [("net_a/input".to_string(), VStreamParams::default())].into();
    let input = core_op.create_input_vstreams(&params).unwrap().remove(0);
    let params: BTreeMap<String, VStreamParams> =
        [("net_a/output".to_string(), VStreamParams::default())].into();
    let output = core_op.create_output_vstreams(&params).unwrap().remove(0);

    let _active = core_op.activate_with_guard(DEFAULT_BATCH_SIZE).unwrap();
    std::thread::scope(|scope| {
        for value in [1u8, 2] {
            let input = &input;
            scope.spawn(move || {
                for _ in 0..FRAMES {
                    input.write(&[value; 8]).unwrap();
                }
            });
        }
    });

    let mut counts = HashMap::new();
    let mut frame = [0u8; 8];
    for _ in 0..2 * FRAMES {
        output.read(&mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == frame[0]), "torn frame {:?}", frame);
        *counts.entry(frame[0]).or_insert(0usize) += 1;
    }
    assert_eq!(counts, HashMap::from([(1u8, FRAMES), (2u8, FRAMES)]));
}
