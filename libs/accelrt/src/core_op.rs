// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Core-op: one configured, activatable workload bound to a device.
//!
//! Owns the layer streams, the activation event and the activation timing
//! statistics. Activation is exclusive per device and goes through the
//! shared [`ActiveCoreOpHolder`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::accumulator::{AccumulatorPtr, FullAccumulator};
use crate::active_core_op_holder::ActiveCoreOpHolderPtr;
use crate::config::{
    ConfigureNetworkParams, DEFAULT_ACTUAL_BATCH_SIZE, DEFAULT_BATCH_SIZE,
    LatencyMeasurementFlags, MAX_ACTIVE_TRANSFERS_SCALE, StreamInterface, StreamParameters,
    TransportParams,
};
use crate::device::DevicePtr;
use crate::error::{AccelError, Result};
use crate::event::{Event, EventPtr};
use crate::latency_meter::{LatencyMeter, LatencyMeterPtr, LatencyMetersMap};
use crate::metadata::{CoreOpMetadataPtr, LayerInfo, NetworkInfo, StreamDirection, StreamInfo, SupportedFeatures};
use crate::resource_manager::ResourcesManagerPtr;
use crate::stream::{
    EthInputStream, EthOutputStream, InputStreamPtr, MipiInputStream, NmsOutputStream,
    OutputStreamPtr, StreamBase, StreamBufferMode, VdmaInputStream, VdmaOutputStream,
};
use crate::vstream::{InputVStream, OutputVStream, VStreamInfo, VStreamParams};

static NEXT_CORE_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a core-op instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreOpId(u64);

impl CoreOpId {
    fn next() -> Self {
        Self(NEXT_CORE_OP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoreOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreOpState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    /// Activation was aborted by the user; activating again is allowed.
    Aborted,
}

/// Tuning applied by the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerParams {
    pub timeout: Duration,
    pub threshold: u32,
    pub priority: u8,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            threshold: 1,
            priority: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyMeasurementResult {
    pub avg_hw_latency: Duration,
}

/// Key of an intermediate device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntermediateBufferKey {
    pub context_index: u16,
    pub stream_index: u8,
}

pub type CoreOpPtr = Arc<CoreOp>;

pub struct CoreOp {
    id: CoreOpId,
    weak_self: Weak<CoreOp>,
    config: ConfigureNetworkParams,
    metadata: CoreOpMetadataPtr,
    holder: ActiveCoreOpHolderPtr,
    resources_manager: Option<ResourcesManagerPtr>,
    min_configured_batch_size: u16,
    activation_event: EventPtr,
    activation_time_accumulator: AccumulatorPtr,
    deactivation_time_accumulator: AccumulatorPtr,
    latency_meters: LatencyMetersMap,
    input_streams: RwLock<BTreeMap<String, InputStreamPtr>>,
    output_streams: RwLock<BTreeMap<String, OutputStreamPtr>>,
    device: RwLock<Option<DevicePtr>>,
    state: Mutex<CoreOpState>,
    scheduler: Mutex<Option<SchedulerParams>>,
}

impl fmt::Debug for CoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreOp")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CoreOp {
    /// Build a core-op for `metadata` with the given configuration.
    ///
    /// `resources_manager` provides the boundary channels of DMA streams and
    /// may be omitted for core-ops without any.
    pub fn new(
        config: ConfigureNetworkParams,
        metadata: CoreOpMetadataPtr,
        holder: ActiveCoreOpHolderPtr,
        resources_manager: Option<ResourcesManagerPtr>,
    ) -> Result<Arc<Self>> {
        if let Some(unknown) = config
            .network_params_by_name
            .keys()
            .find(|name| !metadata.network_names().contains(*name))
        {
            return Err(AccelError::InvalidArgument(format!(
                "network '{}' is not part of core-op '{}'",
                unknown,
                metadata.core_op_name()
            )));
        }

        let min_configured_batch_size = config.smallest_configured_batch_size();
        let latency_meters = if config.latency.contains(LatencyMeasurementFlags::MEASURE) {
            Self::create_latency_meters(&metadata)
        } else {
            LatencyMetersMap::new()
        };

        let core_op = Arc::new_cyclic(|weak_self| Self {
            id: CoreOpId::next(),
            weak_self: weak_self.clone(),
            config,
            metadata,
            holder,
            resources_manager,
            min_configured_batch_size,
            activation_event: Event::new_shared(false),
            activation_time_accumulator: FullAccumulator::new_shared("activation_time"),
            deactivation_time_accumulator: FullAccumulator::new_shared("deactivation_time"),
            latency_meters,
            input_streams: RwLock::new(BTreeMap::new()),
            output_streams: RwLock::new(BTreeMap::new()),
            device: RwLock::new(None),
            state: Mutex::new(CoreOpState::Inactive),
            scheduler: Mutex::new(None),
        });
        tracing::debug!(
            core_op = %core_op.name(),
            id = %core_op.id,
            min_batch_size = min_configured_batch_size,
            "Created core-op"
        );
        Ok(core_op)
    }

    fn create_latency_meters(metadata: &CoreOpMetadataPtr) -> LatencyMetersMap {
        metadata
            .network_names()
            .iter()
            .map(|network| {
                let outputs = metadata
                    .get_output_layer_infos()
                    .into_iter()
                    .filter(|layer| &layer.network_name == network)
                    .map(|layer| layer.name);
                (network.clone(), Arc::new(LatencyMeter::new(outputs)))
            })
            .collect()
    }

    pub fn id(&self) -> CoreOpId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.metadata.core_op_name()
    }

    pub fn state(&self) -> CoreOpState {
        *self.state.lock()
    }

    fn set_state(&self, state: CoreOpState) {
        *self.state.lock() = state;
    }

    pub fn min_configured_batch_size(&self) -> u16 {
        self.min_configured_batch_size
    }

    pub fn metadata(&self) -> &CoreOpMetadataPtr {
        &self.metadata
    }

    fn self_arc(&self) -> Result<Arc<Self>> {
        self.weak_self.upgrade().ok_or_else(|| {
            AccelError::InternalFailure(format!("core-op '{}' is being dropped", self.name()))
        })
    }

    // ----- activation -----

    fn resolve_batch_size(&self, dynamic_batch_size: u16) -> Result<u16> {
        if dynamic_batch_size == DEFAULT_BATCH_SIZE {
            return Ok(self.min_configured_batch_size);
        }
        if dynamic_batch_size > self.min_configured_batch_size {
            return Err(AccelError::InvalidArgument(format!(
                "dynamic batch size {} exceeds the smallest configured batch size {} of '{}'",
                dynamic_batch_size,
                self.min_configured_batch_size,
                self.name()
            )));
        }
        Ok(dynamic_batch_size)
    }

    /// Activate this core-op on its device.
    ///
    /// Refused while a scheduler drives activation or while another core-op
    /// is active. On failure partial activation is undone; a user abort is
    /// returned as-is without rollback.
    pub fn activate(&self, dynamic_batch_size: u16) -> Result<()> {
        let start = Instant::now();
        if self.is_scheduled() {
            return Err(AccelError::InvalidOperation(format!(
                "manual activation of '{}' is not allowed while the scheduler is active",
                self.name()
            )));
        }
        let batch_size = self.resolve_batch_size(dynamic_batch_size)?;
        let this = self.self_arc()?;
        self.holder.try_set(&this)?;
        self.set_state(CoreOpState::Activating);

        match self.activate_low_level_streams(batch_size) {
            Ok(()) => {}
            Err(e) if e.is_aborted_by_user() => {
                tracing::info!(core_op = %self.name(), "Activation aborted by user");
                self.holder.clear_if(self.id);
                self.set_state(CoreOpState::Aborted);
                return Err(e);
            }
            Err(e) => {
                self.rollback_activation();
                return Err(e);
            }
        }

        if let Err(e) = self.activation_event.signal() {
            tracing::error!(core_op = %self.name(), error = %e, "Failed to signal activation event");
            self.rollback_activation();
            return Err(e);
        }
        self.set_state(CoreOpState::Active);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            core_op = %self.name(),
            batch_size,
            elapsed_ms,
            "[CoreOp] Activated (streams may still be warming up)"
        );
        self.activation_time_accumulator.add_data_point(elapsed_ms);
        Ok(())
    }

    fn rollback_activation(&self) {
        if let Err(e) = self.deactivate_low_level_streams() {
            tracing::error!(core_op = %self.name(), error = %e, "Failed to roll back partial activation");
        }
        self.holder.clear_if(self.id);
        self.set_state(CoreOpState::Inactive);
    }

    /// Activate and get a guard that deactivates on drop.
    pub fn activate_with_guard(&self, dynamic_batch_size: u16) -> Result<ActivatedCoreOp> {
        let core_op = self.self_arc()?;
        self.activate(dynamic_batch_size)?;
        Ok(ActivatedCoreOp { core_op })
    }

    /// Deactivate this core-op. Every stream is attempted; the last stream
    /// failure, if any, is returned.
    pub fn deactivate(&self) -> Result<()> {
        let start = Instant::now();
        if self.is_scheduled() {
            return Err(AccelError::InvalidOperation(format!(
                "manual deactivation of '{}' is not allowed while the scheduler is active",
                self.name()
            )));
        }
        // Only the caller that clears the holder tears the streams down.
        if !self.holder.clear_if(self.id) {
            return Err(match self.holder.active_id() {
                Some(_) => AccelError::InternalFailure(format!(
                    "cannot deactivate '{}': a different core-op is active",
                    self.name()
                )),
                None => AccelError::InvalidOperation(format!(
                    "cannot deactivate '{}': no core-op is active",
                    self.name()
                )),
            });
        }
        self.activation_event.reset();
        self.set_state(CoreOpState::Deactivating);

        let result = self.deactivate_low_level_streams();
        if let Err(e) = &result {
            tracing::error!(core_op = %self.name(), error = %e, "Failed deactivating core-op");
        }
        self.set_state(CoreOpState::Inactive);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(core_op = %self.name(), elapsed_ms, "[CoreOp] Deactivated");
        self.deactivation_time_accumulator.add_data_point(elapsed_ms);
        result
    }

    /// Block until activation completes or `timeout` elapses.
    pub fn wait_for_activation(&self, timeout: Duration) -> Result<()> {
        self.activation_event.wait(timeout)
    }

    pub fn activation_event(&self) -> &EventPtr {
        &self.activation_event
    }

    fn activate_low_level_streams(&self, dynamic_batch_size: u16) -> Result<()> {
        for (name, stream) in self.input_streams.read().iter() {
            stream.activate_stream(dynamic_batch_size).inspect_err(|e| {
                tracing::warn!(stream = %name, error = %e, "Failed to activate input stream");
            })?;
        }
        for (name, stream) in self.output_streams.read().iter() {
            stream.activate_stream(dynamic_batch_size).inspect_err(|e| {
                tracing::warn!(stream = %name, error = %e, "Failed to activate output stream");
            })?;
        }
        Ok(())
    }

    /// Best effort: every stream is attempted.
    fn deactivate_low_level_streams(&self) -> Result<()> {
        let inputs = self
            .input_streams
            .read()
            .iter()
            .map(|(name, stream)| (name.clone(), stream.deactivate_stream()))
            .collect::<Vec<_>>();
        let outputs = self
            .output_streams
            .read()
            .iter()
            .map(|(name, stream)| (name.clone(), stream.deactivate_stream()))
            .collect::<Vec<_>>();

        inputs
            .into_iter()
            .chain(outputs)
            .fold(Ok(()), |last, (name, result)| match result {
                Ok(()) => last,
                Err(e) => {
                    tracing::error!(stream = %name, error = %e, "Failed to deactivate stream");
                    Err(e)
                }
            })
    }

    // ----- stream construction -----

    /// Create and register every stream listed in the configuration.
    ///
    /// All or nothing: if any stream fails to build, none is registered.
    pub fn create_streams_from_config_params(&self, device: DevicePtr) -> Result<()> {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (name, params) in &self.config.stream_params_by_name {
            match params.direction {
                StreamDirection::HostToDevice => {
                    inputs.push(self.create_input_stream_from_config_params(&device, params, name)?);
                }
                StreamDirection::DeviceToHost => {
                    outputs.push(self.create_output_stream_from_config_params(&device, params, name)?);
                }
            }
        }
        self.register_streams(inputs, outputs)?;
        *self.device.write() = Some(device);
        Ok(())
    }

    fn register_streams(&self, inputs: Vec<InputStreamPtr>, outputs: Vec<OutputStreamPtr>) -> Result<()> {
        let mut input_streams = self.input_streams.write();
        let mut output_streams = self.output_streams.write();
        if let Some(stream) = inputs.iter().find(|s| input_streams.contains_key(s.name())) {
            return Err(AccelError::InvalidArgument(format!(
                "input stream '{}' is configured more than once",
                stream.name()
            )));
        }
        if let Some(stream) = outputs.iter().find(|s| output_streams.contains_key(s.name())) {
            return Err(AccelError::InvalidArgument(format!(
                "output stream '{}' is configured more than once",
                stream.name()
            )));
        }
        input_streams.extend(inputs.into_iter().map(|s| (s.name().to_string(), s)));
        output_streams.extend(outputs.into_iter().map(|s| (s.name().to_string(), s)));
        tracing::debug!(
            core_op = %self.name(),
            inputs = input_streams.len(),
            outputs = output_streams.len(),
            "Registered streams"
        );
        Ok(())
    }

    fn layer_for_stream(
        &self,
        device: &DevicePtr,
        params: &StreamParameters,
        stream_name: &str,
        direction: StreamDirection,
    ) -> Result<LayerInfo> {
        let layer = self.get_layer_info(stream_name)?;
        if layer.direction != direction || params.direction != direction {
            return Err(AccelError::InvalidArgument(format!(
                "stream '{}' is not an {} stream",
                stream_name,
                if direction == StreamDirection::HostToDevice { "input" } else { "output" }
            )));
        }
        if !device.is_stream_interface_supported(params.interface) {
            return Err(AccelError::InvalidOperation(format!(
                "device {} does not support {:?} streams. Update the stream parameters of '{}' \
                 to an interface the device supports",
                device.device_id(),
                params.interface,
                stream_name
            )));
        }
        Ok(layer)
    }

    fn buffer_mode_for(params: &StreamParameters) -> StreamBufferMode {
        if params.is_async() {
            StreamBufferMode::NotOwning
        } else {
            StreamBufferMode::Owning
        }
    }

    fn boundary_channel(&self, stream_name: &str) -> Result<crate::vdma::BoundaryChannelPtr> {
        let manager = self.resources_manager.as_ref().ok_or_else(|| {
            AccelError::NotFound(format!(
                "core-op '{}' has no resources manager for stream '{}'",
                self.name(),
                stream_name
            ))
        })?;
        manager.get_boundary_vdma_channel_by_stream_name(stream_name)
    }

    fn vdma_device(&self, device: &DevicePtr) -> Result<Arc<dyn crate::device::VdmaDevice>> {
        device.clone().as_vdma_device().ok_or_else(|| {
            AccelError::InternalFailure(format!(
                "device {} of type {} has no DMA engine",
                device.device_id(),
                device.device_type()
            ))
        })
    }

    fn latency_meter_for(&self, layer: &LayerInfo) -> Option<LatencyMeterPtr> {
        self.latency_meters.get(&layer.network_name).cloned()
    }

    /// Construct the input stream for `stream_name` without registering it.
    pub fn create_input_stream_from_config_params(
        &self,
        device: &DevicePtr,
        params: &StreamParameters,
        stream_name: &str,
    ) -> Result<InputStreamPtr> {
        let layer = self.layer_for_stream(device, params, stream_name, StreamDirection::HostToDevice)?;
        let stream: InputStreamPtr = match (params.interface, params.transport) {
            (StreamInterface::Pcie | StreamInterface::Integrated, TransportParams::Vdma) => {
                let vdma_device = self.vdma_device(device)?;
                let channel = self.boundary_channel(stream_name)?;
                let meter = self.latency_meter_for(&layer);
                Arc::new(VdmaInputStream::new(
                    vdma_device,
                    channel,
                    layer,
                    params.interface,
                    self.activation_event.clone(),
                    meter,
                ))
            }
            (StreamInterface::Eth, TransportParams::EthInput(eth_params)) => Arc::new(
                EthInputStream::new(device.clone(), layer, eth_params, self.activation_event.clone())?,
            ),
            (StreamInterface::Mipi, TransportParams::MipiInput(mipi_params)) => Arc::new(
                MipiInputStream::new(device.clone(), layer, mipi_params, self.activation_event.clone()),
            ),
            (interface, transport) => {
                return Err(AccelError::NotImplemented(format!(
                    "input stream '{}' over {:?} with {:?} parameters",
                    stream_name, interface, transport
                )));
            }
        };
        stream.set_buffer_mode(Self::buffer_mode_for(params))?;
        Ok(stream)
    }

    /// Construct the output stream for `stream_name` without registering it.
    ///
    /// Detection layers come back wrapped in an [`NmsOutputStream`].
    pub fn create_output_stream_from_config_params(
        &self,
        device: &DevicePtr,
        params: &StreamParameters,
        stream_name: &str,
    ) -> Result<OutputStreamPtr> {
        let layer = self.layer_for_stream(device, params, stream_name, StreamDirection::DeviceToHost)?;
        let is_nms = layer.is_nms();
        let stream: OutputStreamPtr = match (params.interface, params.transport) {
            (StreamInterface::Pcie | StreamInterface::Integrated, TransportParams::Vdma) => {
                let vdma_device = self.vdma_device(device)?;
                let channel = self.boundary_channel(stream_name)?;
                let meter = self.latency_meter_for(&layer);
                Arc::new(VdmaOutputStream::new(
                    vdma_device,
                    channel,
                    layer,
                    params.interface,
                    self.activation_event.clone(),
                    meter,
                ))
            }
            (StreamInterface::Eth, TransportParams::EthOutput(eth_params)) => Arc::new(
                EthOutputStream::new(device.clone(), layer, eth_params, self.activation_event.clone())?,
            ),
            (interface, transport) => {
                return Err(AccelError::NotImplemented(format!(
                    "output stream '{}' over {:?} with {:?} parameters",
                    stream_name, interface, transport
                )));
            }
        };

        let stream: OutputStreamPtr = if is_nms {
            let queue_size = self.min_configured_batch_size as usize * MAX_ACTIVE_TRANSFERS_SCALE;
            Arc::new(NmsOutputStream::new(stream, queue_size)?)
        } else {
            stream
        };
        stream.set_buffer_mode(Self::buffer_mode_for(params))?;
        Ok(stream)
    }

    /// Register a constructed input stream. Names are unique per direction.
    pub fn add_input_stream(&self, stream: InputStreamPtr) -> Result<()> {
        let mut streams = self.input_streams.write();
        if streams.contains_key(stream.name()) {
            return Err(AccelError::InvalidArgument(format!(
                "input stream '{}' is configured more than once",
                stream.name()
            )));
        }
        streams.insert(stream.name().to_string(), stream);
        Ok(())
    }

    pub fn add_output_stream(&self, stream: OutputStreamPtr) -> Result<()> {
        let mut streams = self.output_streams.write();
        if streams.contains_key(stream.name()) {
            return Err(AccelError::InvalidArgument(format!(
                "output stream '{}' is configured more than once",
                stream.name()
            )));
        }
        streams.insert(stream.name().to_string(), stream);
        Ok(())
    }

    // ----- stream queries -----

    pub fn get_input_streams(&self) -> Vec<InputStreamPtr> {
        self.input_streams.read().values().cloned().collect()
    }

    pub fn get_output_streams(&self) -> Vec<OutputStreamPtr> {
        self.output_streams.read().values().cloned().collect()
    }

    pub fn get_input_stream_by_name(&self, name: &str) -> Result<InputStreamPtr> {
        self.input_streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AccelError::NotFound(format!("input stream '{}'", name)))
    }

    pub fn get_output_stream_by_name(&self, name: &str) -> Result<OutputStreamPtr> {
        self.output_streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AccelError::NotFound(format!("output stream '{}'", name)))
    }

    /// Empty `network_name` selects every network.
    pub fn get_input_streams_by_network(&self, network_name: &str) -> Result<Vec<InputStreamPtr>> {
        let infos = self.metadata.get_input_stream_infos(network_name)?;
        let streams = self.input_streams.read();
        Ok(infos
            .iter()
            .filter_map(|info| streams.get(&info.name).cloned())
            .collect())
    }

    pub fn get_output_streams_by_network(&self, network_name: &str) -> Result<Vec<OutputStreamPtr>> {
        let infos = self.metadata.get_output_stream_infos(network_name)?;
        let streams = self.output_streams.read();
        Ok(infos
            .iter()
            .filter_map(|info| streams.get(&info.name).cloned())
            .collect())
    }

    pub fn get_input_streams_by_interface(&self, interface: StreamInterface) -> Vec<InputStreamPtr> {
        self.input_streams
            .read()
            .values()
            .filter(|stream| stream.interface() == interface)
            .cloned()
            .collect()
    }

    pub fn get_output_streams_by_interface(&self, interface: StreamInterface) -> Vec<OutputStreamPtr> {
        self.output_streams
            .read()
            .values()
            .filter(|stream| stream.interface() == interface)
            .cloned()
            .collect()
    }

    // ----- metadata queries -----

    /// Layer by name, including planes of multi-planar layers.
    pub fn get_layer_info(&self, stream_name: &str) -> Result<LayerInfo> {
        self.metadata.get_layer_info(stream_name)
    }

    /// Configured batch size of the network owning `stream_name`.
    pub fn get_stream_batch_size(&self, stream_name: &str) -> Result<u16> {
        let layer = self.get_layer_info(stream_name)?;
        self.config
            .network_params_by_name
            .get(&layer.network_name)
            .map(|params| match params.batch_size {
                DEFAULT_BATCH_SIZE => DEFAULT_ACTUAL_BATCH_SIZE,
                batch_size => batch_size,
            })
            .ok_or_else(|| {
                AccelError::NotFound(format!(
                    "batch size for stream '{}' (network '{}' is not configured)",
                    stream_name, layer.network_name
                ))
            })
    }

    pub fn get_latency_meters(&self) -> &LatencyMetersMap {
        &self.latency_meters
    }

    /// Average hardware latency of one network, or of all networks when
    /// `network_name` is empty.
    pub fn get_latency_measurement(&self, network_name: &str) -> Result<LatencyMeasurementResult> {
        let clear = self
            .config
            .latency
            .contains(LatencyMeasurementFlags::CLEAR_AFTER_GET);

        if !network_name.is_empty() {
            let meter = self.latency_meters.get(network_name).ok_or_else(|| {
                AccelError::NotAvailable(format!(
                    "no latency measurement for network '{}'",
                    network_name
                ))
            })?;
            return Ok(LatencyMeasurementResult {
                avg_hw_latency: meter.get_latency(clear)?,
            });
        }

        if self.input_streams.read().len() != 1 {
            return Err(AccelError::NotAvailable(
                "latency of all networks needs exactly one input stream".into(),
            ));
        }
        let measured: Vec<Duration> = self
            .latency_meters
            .values()
            .filter_map(|meter| meter.get_latency(clear).ok())
            .collect();
        if measured.is_empty() {
            tracing::debug!(core_op = %self.name(), "No latency measurement found");
            return Err(AccelError::NotAvailable("no latency measurement found".into()));
        }
        Ok(LatencyMeasurementResult {
            avg_hw_latency: measured.iter().sum::<Duration>() / measured.len() as u32,
        })
    }

    pub fn is_nms(&self) -> bool {
        self.metadata
            .get_output_layer_infos()
            .iter()
            .any(LayerInfo::is_nms)
    }

    pub fn is_multi_context(&self) -> bool {
        self.metadata.supported_features().multi_context
    }

    pub fn is_default_batch_size(&self) -> bool {
        self.config.is_default_batch_size()
    }

    pub fn get_supported_features(&self) -> SupportedFeatures {
        self.metadata.supported_features()
    }

    pub fn get_all_stream_infos(&self, network_name: &str) -> Result<Vec<StreamInfo>> {
        self.metadata.get_all_stream_infos(network_name)
    }

    pub fn get_network_infos(&self) -> Vec<NetworkInfo> {
        self.metadata.get_network_infos()
    }

    pub fn get_config_params(&self) -> ConfigureNetworkParams {
        self.config.clone()
    }

    pub fn get_default_streams_interface(&self) -> Result<StreamInterface> {
        match self.device.read().as_ref() {
            Some(device) => device.default_streams_interface(),
            None => Err(AccelError::NotAvailable(format!(
                "core-op '{}' has no streams bound to a device",
                self.name()
            ))),
        }
    }

    pub fn get_activation_time_accumulator(&self) -> AccumulatorPtr {
        self.activation_time_accumulator.clone()
    }

    pub fn get_deactivation_time_accumulator(&self) -> AccumulatorPtr {
        self.deactivation_time_accumulator.clone()
    }

    pub fn get_intermediate_buffer(&self, key: IntermediateBufferKey) -> Result<Vec<u8>> {
        Err(AccelError::NotSupported(format!(
            "intermediate buffer {:?} of core-op '{}'",
            key,
            self.name()
        )))
    }

    // ----- scheduler -----

    /// Hand activation over to the scheduler. Manual activation is refused afterwards.
    pub fn attach_scheduler(&self, params: SchedulerParams) {
        *self.scheduler.lock() = Some(params);
    }

    pub fn detach_scheduler(&self) {
        self.scheduler.lock().take();
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    pub fn scheduler_params(&self) -> Option<SchedulerParams> {
        *self.scheduler.lock()
    }

    fn update_scheduler(
        &self,
        what: &str,
        network_name: &str,
        update: impl FnOnce(&mut SchedulerParams),
    ) -> Result<()> {
        if !network_name.is_empty() && network_name != self.name() {
            return Err(AccelError::InvalidOperation(format!(
                "setting scheduler {} for network '{}' is not supported, only for all networks",
                what, network_name
            )));
        }
        let mut scheduler = self.scheduler.lock();
        let params = scheduler.as_mut().ok_or_else(|| {
            AccelError::InvalidOperation(format!(
                "cannot set scheduler {} of '{}': scheduler is not active",
                what,
                self.name()
            ))
        })?;
        update(params);
        Ok(())
    }

    pub fn set_scheduler_timeout(&self, timeout: Duration, network_name: &str) -> Result<()> {
        self.update_scheduler("timeout", network_name, |params| params.timeout = timeout)
    }

    pub fn set_scheduler_threshold(&self, threshold: u32, network_name: &str) -> Result<()> {
        self.update_scheduler("threshold", network_name, |params| params.threshold = threshold)
    }

    pub fn set_scheduler_priority(&self, priority: u8, network_name: &str) -> Result<()> {
        self.update_scheduler("priority", network_name, |params| params.priority = priority)
    }

    // ----- vstreams -----

    pub fn get_input_vstream_infos(&self, network_name: &str) -> Result<Vec<VStreamInfo>> {
        self.metadata.get_input_stream_infos(network_name)
    }

    pub fn get_output_vstream_infos(&self, network_name: &str) -> Result<Vec<VStreamInfo>> {
        self.metadata.get_output_stream_infos(network_name)
    }

    pub fn create_input_vstreams(
        &self,
        params_by_name: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<InputVStream>> {
        params_by_name
            .iter()
            .map(|(name, params)| Ok(InputVStream::new(self.get_input_stream_by_name(name)?, params)))
            .collect()
    }

    pub fn create_output_vstreams(
        &self,
        params_by_name: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<OutputVStream>> {
        params_by_name
            .iter()
            .map(|(name, params)| Ok(OutputVStream::new(self.get_output_stream_by_name(name)?, params)))
            .collect()
    }
}

impl Drop for CoreOp {
    fn drop(&mut self) {
        if self.holder.clear_if(self.id) {
            tracing::warn!(core_op = %self.name(), "Core-op dropped while active, deactivating");
            if let Err(e) = self.deactivate_low_level_streams() {
                tracing::error!(core_op = %self.name(), error = %e, "Failed to deactivate dropped core-op");
            }
        }
    }
}

/// Guard of an activated core-op. Deactivates on drop.
#[must_use = "dropping the guard deactivates the core-op"]
pub struct ActivatedCoreOp {
    core_op: Arc<CoreOp>,
}

impl ActivatedCoreOp {
    pub fn core_op(&self) -> &Arc<CoreOp> {
        &self.core_op
    }

    pub fn wait_for_activation(&self, timeout: Duration) -> Result<()> {
        self.core_op.wait_for_activation(timeout)
    }
}

impl Drop for ActivatedCoreOp {
    fn drop(&mut self) {
        if let Err(e) = self.core_op.deactivate() {
            tracing::error!(core_op = %self.core_op.name(), error = %e, "Failed to deactivate core-op");
        }
    }
}
