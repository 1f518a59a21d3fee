// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Client side of the proxy: network groups and vstreams living in the
//! service process, driven through blocking calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use accelrt::{
    AccelError, AccumulatorPtr, ConfigureNetworkParams, DEFAULT_VSTREAM_TIMEOUT_MS,
    InputStreamPtr, LatencyMeasurementResult, NetworkInfo, OutputStreamPtr, Result,
    StreamInterface, VStreamInfo, VStreamParams,
};
use accelrt::metadata::StreamInfo;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Response};

use crate::config::{DEFAULT_SERVICE_ADDR, SERVICE_ADDR_ENV};
use crate::proto::core_op_rpc_client::CoreOpRpcClient;
use crate::proto::{
    GetServiceVersionRequest, InputVStreamWriteRequest, KeepAliveRequest, MAX_MESSAGE_SIZE,
    NetworkGroupHandleRequest, NetworkGroupIdentifier, NetworkGroupRequest,
    OutputVStreamReadRequest, SetSchedulerPriorityRequest, SetSchedulerThresholdRequest,
    SetSchedulerTimeoutRequest, VStreamHandleRequest, VStreamIdentifier, VStreamParamsEntry,
    VStreamRequest, VStreamsCreateRequest,
};

/// Deadline of every call. Longer than the default vstream timeout so a
/// device-side timeout is reported as such rather than as a lost call.
pub const CALL_TIMEOUT: Duration = Duration::from_millis(DEFAULT_VSTREAM_TIMEOUT_MS + 500);

/// Service address from `ACCELRT_SERVICE_ADDR`, else the default.
pub fn service_addr() -> String {
    std::env::var(SERVICE_ADDR_ENV).unwrap_or_else(|_| DEFAULT_SERVICE_ADDR.to_string())
}

fn check(status: u32, what: &str) -> Result<()> {
    match AccelError::from_status(status, what) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| AccelError::InternalFailure(format!("{}: malformed reply: {}", what, e)))
}

fn map_transport_error(method: &str, status: tonic::Status) -> AccelError {
    match status.code() {
        Code::DeadlineExceeded | Code::Cancelled => {
            AccelError::Timeout(format!("{}: {}", method, status.message()))
        }
        code => AccelError::InternalFailure(format!(
            "{}: service unreachable ({:?}): {}",
            method,
            code,
            status.message()
        )),
    }
}

// ----- RpcClient -----

/// Blocking connection to the service.
///
/// Owns a current-thread runtime; each call blocks on it with
/// [`CALL_TIMEOUT`]. Must not be used from inside another tokio runtime.
pub struct RpcClient {
    runtime: Runtime,
    client: CoreOpRpcClient<Channel>,
    addr: String,
}

impl RpcClient {
    /// Prepare a connection to `addr`. The channel connects on first use.
    pub fn connect(addr: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| AccelError::InvalidArgument(format!("bad service address '{}': {}", addr, e)))?
            .connect_timeout(CALL_TIMEOUT);
        let channel = {
            let _guard = runtime.enter();
            endpoint.connect_lazy()
        };
        Ok(Self {
            runtime,
            client: CoreOpRpcClient::new(channel)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn call<R, F, Fut>(&self, method: &str, call: F) -> Result<R>
    where
        F: FnOnce(CoreOpRpcClient<Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<R>, tonic::Status>>,
    {
        let pending = call(self.client.clone());
        match self
            .runtime
            .block_on(async { tokio::time::timeout(CALL_TIMEOUT, pending).await })
        {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(map_transport_error(method, status)),
            Err(_) => Err(AccelError::Timeout(format!(
                "{}: no reply within {:?}",
                method, CALL_TIMEOUT
            ))),
        }
    }

    pub fn keep_alive(&self, pid: u32) -> Result<()> {
        let reply = self.call("KeepAlive", |mut c| async move {
            c.keep_alive(KeepAliveRequest { pid }).await
        })?;
        check(reply.status, "KeepAlive")
    }

    /// Service version and protocol version.
    pub fn get_service_version(&self) -> Result<(String, u32)> {
        let reply = self.call("GetServiceVersion", |mut c| async move {
            c.get_service_version(GetServiceVersionRequest {}).await
        })?;
        check(reply.status, "GetServiceVersion")?;
        Ok((reply.version, reply.protocol_version))
    }

    // ----- network groups -----

    pub fn network_group_dup_handle(&self, identifier: NetworkGroupIdentifier, pid: u32) -> Result<u32> {
        let request = NetworkGroupHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("NetworkGroupDupHandle", |mut c| async move {
            c.network_group_dup_handle(request).await
        })?;
        check(reply.status, "NetworkGroupDupHandle")?;
        Ok(reply.handle)
    }

    pub fn network_group_release(&self, identifier: NetworkGroupIdentifier, pid: u32) -> Result<()> {
        let request = NetworkGroupHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("NetworkGroupRelease", |mut c| async move {
            c.network_group_release(request).await
        })?;
        check(reply.status, "NetworkGroupRelease")
    }

    pub fn network_group_name(&self, identifier: NetworkGroupIdentifier) -> Result<String> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupName", |mut c| async move {
            c.network_group_name(request).await
        })?;
        check(reply.status, "NetworkGroupName")?;
        Ok(reply.value)
    }

    pub fn network_group_get_network_infos(&self, identifier: NetworkGroupIdentifier) -> Result<Vec<NetworkInfo>> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupGetNetworkInfos", |mut c| async move {
            c.network_group_get_network_infos(request).await
        })?;
        check(reply.status, "NetworkGroupGetNetworkInfos")?;
        Ok(reply
            .network_names
            .into_iter()
            .map(|name| NetworkInfo { name })
            .collect())
    }

    pub fn network_group_get_all_stream_infos(
        &self,
        identifier: NetworkGroupIdentifier,
        network_name: &str,
    ) -> Result<Vec<StreamInfo>> {
        let request = ng_request(identifier, network_name);
        let reply = self.call("NetworkGroupGetAllStreamInfos", |mut c| async move {
            c.network_group_get_all_stream_infos(request).await
        })?;
        check(reply.status, "NetworkGroupGetAllStreamInfos")?;
        from_json(&reply.json, "NetworkGroupGetAllStreamInfos")
    }

    pub fn network_group_get_default_stream_interface(
        &self,
        identifier: NetworkGroupIdentifier,
    ) -> Result<StreamInterface> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupGetDefaultStreamInterface", |mut c| async move {
            c.network_group_get_default_stream_interface(request).await
        })?;
        check(reply.status, "NetworkGroupGetDefaultStreamInterface")?;
        StreamInterface::from_u32(reply.value).ok_or_else(|| {
            AccelError::InternalFailure(format!("unknown stream interface {}", reply.value))
        })
    }

    pub fn network_group_is_scheduled(&self, identifier: NetworkGroupIdentifier) -> Result<bool> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupIsScheduled", |mut c| async move {
            c.network_group_is_scheduled(request).await
        })?;
        check(reply.status, "NetworkGroupIsScheduled")?;
        Ok(reply.value)
    }

    pub fn network_group_set_scheduler_timeout(
        &self,
        identifier: NetworkGroupIdentifier,
        timeout: Duration,
        network_name: &str,
    ) -> Result<()> {
        let timeout_ms = u32::try_from(timeout.as_millis()).map_err(|_| {
            AccelError::InvalidArgument(format!("scheduler timeout {:?} is too long", timeout))
        })?;
        let request = SetSchedulerTimeoutRequest {
            identifier: Some(identifier),
            timeout_ms,
            network_name: network_name.to_string(),
        };
        let reply = self.call("NetworkGroupSetSchedulerTimeout", |mut c| async move {
            c.network_group_set_scheduler_timeout(request).await
        })?;
        check(reply.status, "NetworkGroupSetSchedulerTimeout")
    }

    pub fn network_group_set_scheduler_threshold(
        &self,
        identifier: NetworkGroupIdentifier,
        threshold: u32,
        network_name: &str,
    ) -> Result<()> {
        let request = SetSchedulerThresholdRequest {
            identifier: Some(identifier),
            threshold,
            network_name: network_name.to_string(),
        };
        let reply = self.call("NetworkGroupSetSchedulerThreshold", |mut c| async move {
            c.network_group_set_scheduler_threshold(request).await
        })?;
        check(reply.status, "NetworkGroupSetSchedulerThreshold")
    }

    pub fn network_group_set_scheduler_priority(
        &self,
        identifier: NetworkGroupIdentifier,
        priority: u8,
        network_name: &str,
    ) -> Result<()> {
        let request = SetSchedulerPriorityRequest {
            identifier: Some(identifier),
            priority: u32::from(priority),
            network_name: network_name.to_string(),
        };
        let reply = self.call("NetworkGroupSetSchedulerPriority", |mut c| async move {
            c.network_group_set_scheduler_priority(request).await
        })?;
        check(reply.status, "NetworkGroupSetSchedulerPriority")
    }

    pub fn network_group_get_latency_measurement(
        &self,
        identifier: NetworkGroupIdentifier,
        network_name: &str,
    ) -> Result<LatencyMeasurementResult> {
        let request = ng_request(identifier, network_name);
        let reply = self.call("NetworkGroupGetLatencyMeasurement", |mut c| async move {
            c.network_group_get_latency_measurement(request).await
        })?;
        check(reply.status, "NetworkGroupGetLatencyMeasurement")?;
        Ok(LatencyMeasurementResult {
            avg_hw_latency: Duration::from_nanos(reply.avg_hw_latency_ns),
        })
    }

    pub fn network_group_is_multi_context(&self, identifier: NetworkGroupIdentifier) -> Result<bool> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupIsMultiContext", |mut c| async move {
            c.network_group_is_multi_context(request).await
        })?;
        check(reply.status, "NetworkGroupIsMultiContext")?;
        Ok(reply.value)
    }

    pub fn network_group_get_config_params(
        &self,
        identifier: NetworkGroupIdentifier,
    ) -> Result<ConfigureNetworkParams> {
        let request = ng_request(identifier, "");
        let reply = self.call("NetworkGroupGetConfigParams", |mut c| async move {
            c.network_group_get_config_params(request).await
        })?;
        check(reply.status, "NetworkGroupGetConfigParams")?;
        ConfigureNetworkParams::from_json_str(&reply.json)
    }

    pub fn network_group_get_input_vstream_infos(
        &self,
        identifier: NetworkGroupIdentifier,
        network_name: &str,
    ) -> Result<Vec<VStreamInfo>> {
        let request = ng_request(identifier, network_name);
        let reply = self.call("NetworkGroupGetInputVStreamInfos", |mut c| async move {
            c.network_group_get_input_vstream_infos(request).await
        })?;
        check(reply.status, "NetworkGroupGetInputVStreamInfos")?;
        from_json(&reply.json, "NetworkGroupGetInputVStreamInfos")
    }

    pub fn network_group_get_output_vstream_infos(
        &self,
        identifier: NetworkGroupIdentifier,
        network_name: &str,
    ) -> Result<Vec<VStreamInfo>> {
        let request = ng_request(identifier, network_name);
        let reply = self.call("NetworkGroupGetOutputVStreamInfos", |mut c| async move {
            c.network_group_get_output_vstream_infos(request).await
        })?;
        check(reply.status, "NetworkGroupGetOutputVStreamInfos")?;
        from_json(&reply.json, "NetworkGroupGetOutputVStreamInfos")
    }

    // ----- vstream lifetime -----

    /// Create input vstreams; handles come back in name order.
    pub fn input_vstreams_create(
        &self,
        identifier: NetworkGroupIdentifier,
        pid: u32,
        params: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<u32>> {
        let request = vstreams_create_request(identifier, pid, params);
        let reply = self.call("InputVStreamsCreate", |mut c| async move {
            c.input_vstreams_create(request).await
        })?;
        check(reply.status, "InputVStreamsCreate")?;
        Ok(reply.handles)
    }

    /// Create output vstreams; handles come back in name order.
    pub fn output_vstreams_create(
        &self,
        identifier: NetworkGroupIdentifier,
        pid: u32,
        params: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<u32>> {
        let request = vstreams_create_request(identifier, pid, params);
        let reply = self.call("OutputVStreamsCreate", |mut c| async move {
            c.output_vstreams_create(request).await
        })?;
        check(reply.status, "OutputVStreamsCreate")?;
        Ok(reply.handles)
    }

    pub fn input_vstream_dup_handle(&self, identifier: VStreamIdentifier, pid: u32) -> Result<u32> {
        let request = VStreamHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("InputVStreamDupHandle", |mut c| async move {
            c.input_vstream_dup_handle(request).await
        })?;
        check(reply.status, "InputVStreamDupHandle")?;
        Ok(reply.handle)
    }

    pub fn output_vstream_dup_handle(&self, identifier: VStreamIdentifier, pid: u32) -> Result<u32> {
        let request = VStreamHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("OutputVStreamDupHandle", |mut c| async move {
            c.output_vstream_dup_handle(request).await
        })?;
        check(reply.status, "OutputVStreamDupHandle")?;
        Ok(reply.handle)
    }

    pub fn input_vstream_release(&self, identifier: VStreamIdentifier, pid: u32) -> Result<()> {
        let request = VStreamHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("InputVStreamRelease", |mut c| async move {
            c.input_vstream_release(request).await
        })?;
        check(reply.status, "InputVStreamRelease")
    }

    pub fn output_vstream_release(&self, identifier: VStreamIdentifier, pid: u32) -> Result<()> {
        let request = VStreamHandleRequest {
            identifier: Some(identifier),
            pid,
        };
        let reply = self.call("OutputVStreamRelease", |mut c| async move {
            c.output_vstream_release(request).await
        })?;
        check(reply.status, "OutputVStreamRelease")
    }

    // ----- vstream data and queries -----

    pub fn input_vstream_write(&self, identifier: VStreamIdentifier, frame: &[u8]) -> Result<()> {
        let request = InputVStreamWriteRequest {
            identifier: Some(identifier),
            data: frame.to_vec(),
        };
        let reply = self.call("InputVStreamWrite", |mut c| async move {
            c.input_vstream_write(request).await
        })?;
        check(reply.status, "InputVStreamWrite")
    }

    pub fn output_vstream_read(&self, identifier: VStreamIdentifier, frame: &mut [u8]) -> Result<()> {
        let size = u32::try_from(frame.len())
            .map_err(|_| AccelError::InvalidArgument(format!("frame of {} bytes is too large", frame.len())))?;
        let request = OutputVStreamReadRequest {
            identifier: Some(identifier),
            size,
        };
        let reply = self.call("OutputVStreamRead", |mut c| async move {
            c.output_vstream_read(request).await
        })?;
        check(reply.status, "OutputVStreamRead")?;
        if reply.data.len() != frame.len() {
            return Err(AccelError::InternalFailure(format!(
                "OutputVStreamRead: expected {} bytes, got {}",
                frame.len(),
                reply.data.len()
            )));
        }
        frame.copy_from_slice(&reply.data);
        Ok(())
    }

    pub fn input_vstream_get_frame_size(&self, identifier: VStreamIdentifier) -> Result<usize> {
        let reply = self.call("InputVStreamGetFrameSize", |mut c| async move {
            c.input_vstream_get_frame_size(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamGetFrameSize")?;
        Ok(reply.value as usize)
    }

    pub fn output_vstream_get_frame_size(&self, identifier: VStreamIdentifier) -> Result<usize> {
        let reply = self.call("OutputVStreamGetFrameSize", |mut c| async move {
            c.output_vstream_get_frame_size(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamGetFrameSize")?;
        Ok(reply.value as usize)
    }

    pub fn input_vstream_name(&self, identifier: VStreamIdentifier) -> Result<String> {
        let reply = self.call("InputVStreamName", |mut c| async move {
            c.input_vstream_name(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamName")?;
        Ok(reply.value)
    }

    pub fn output_vstream_name(&self, identifier: VStreamIdentifier) -> Result<String> {
        let reply = self.call("OutputVStreamName", |mut c| async move {
            c.output_vstream_name(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamName")?;
        Ok(reply.value)
    }

    pub fn input_vstream_network_name(&self, identifier: VStreamIdentifier) -> Result<String> {
        let reply = self.call("InputVStreamNetworkName", |mut c| async move {
            c.input_vstream_network_name(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamNetworkName")?;
        Ok(reply.value)
    }

    pub fn output_vstream_network_name(&self, identifier: VStreamIdentifier) -> Result<String> {
        let reply = self.call("OutputVStreamNetworkName", |mut c| async move {
            c.output_vstream_network_name(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamNetworkName")?;
        Ok(reply.value)
    }

    pub fn input_vstream_abort(&self, identifier: VStreamIdentifier) -> Result<()> {
        let reply = self.call("InputVStreamAbort", |mut c| async move {
            c.input_vstream_abort(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamAbort")
    }

    pub fn output_vstream_abort(&self, identifier: VStreamIdentifier) -> Result<()> {
        let reply = self.call("OutputVStreamAbort", |mut c| async move {
            c.output_vstream_abort(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamAbort")
    }

    pub fn input_vstream_resume(&self, identifier: VStreamIdentifier) -> Result<()> {
        let reply = self.call("InputVStreamResume", |mut c| async move {
            c.input_vstream_resume(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamResume")
    }

    pub fn output_vstream_resume(&self, identifier: VStreamIdentifier) -> Result<()> {
        let reply = self.call("OutputVStreamResume", |mut c| async move {
            c.output_vstream_resume(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamResume")
    }

    pub fn input_vstream_is_aborted(&self, identifier: VStreamIdentifier) -> Result<bool> {
        let reply = self.call("InputVStreamIsAborted", |mut c| async move {
            c.input_vstream_is_aborted(vs_request(identifier)).await
        })?;
        check(reply.status, "InputVStreamIsAborted")?;
        Ok(reply.value)
    }

    pub fn output_vstream_is_aborted(&self, identifier: VStreamIdentifier) -> Result<bool> {
        let reply = self.call("OutputVStreamIsAborted", |mut c| async move {
            c.output_vstream_is_aborted(vs_request(identifier)).await
        })?;
        check(reply.status, "OutputVStreamIsAborted")?;
        Ok(reply.value)
    }
}

fn ng_request(identifier: NetworkGroupIdentifier, network_name: &str) -> NetworkGroupRequest {
    NetworkGroupRequest {
        identifier: Some(identifier),
        network_name: network_name.to_string(),
    }
}

fn vs_request(identifier: VStreamIdentifier) -> VStreamRequest {
    VStreamRequest {
        identifier: Some(identifier),
    }
}

fn vstreams_create_request(
    identifier: NetworkGroupIdentifier,
    pid: u32,
    params: &BTreeMap<String, VStreamParams>,
) -> VStreamsCreateRequest {
    VStreamsCreateRequest {
        identifier: Some(identifier),
        pid,
        params: params
            .iter()
            .map(|(name, params)| VStreamParamsEntry {
                name: name.clone(),
                timeout_ms: params.timeout_ms,
            })
            .collect(),
    }
}

// ----- connection shared by the proxies -----

/// A reconnectable [`RpcClient`] plus the pid calls are attributed to.
struct Connection {
    addr: String,
    client: Mutex<Option<RpcClient>>,
    pid: AtomicU32,
}

impl Connection {
    fn open(addr: &str) -> Result<Self> {
        Ok(Self {
            addr: addr.to_string(),
            client: Mutex::new(Some(RpcClient::connect(addr)?)),
            pid: AtomicU32::new(std::process::id()),
        })
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    fn with<T>(&self, f: impl FnOnce(&RpcClient) -> Result<T>) -> Result<T> {
        let client = self.client.lock();
        match client.as_ref() {
            Some(client) => f(client),
            None => Err(AccelError::InvalidOperation(format!(
                "connection to {} is suspended for fork",
                self.addr
            ))),
        }
    }

    fn disconnect(&self) {
        self.client.lock().take();
    }

    fn reconnect(&self) -> Result<()> {
        *self.client.lock() = Some(RpcClient::connect(&self.addr)?);
        Ok(())
    }

    /// Reconnect as the current process and return the new pid.
    fn reconnect_as_child(&self) -> Result<u32> {
        self.reconnect()?;
        let pid = std::process::id();
        self.pid.store(pid, Ordering::Relaxed);
        Ok(pid)
    }

    /// Run a final release call, opening a fresh connection if suspended.
    ///
    /// Inside an async runtime the call runs on a helper thread, which also
    /// drops the client's own runtime.
    fn release(
        &self,
        what: &'static str,
        call: impl FnOnce(&RpcClient) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let taken = self.client.lock().take();
        let addr = self.addr.clone();
        let run = move || {
            let client = match taken {
                Some(client) => client,
                None => RpcClient::connect(&addr)?,
            };
            call(&client)
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return run();
        }
        tracing::warn!(
            addr = %self.addr,
            call = what,
            "Released from inside an async runtime, blocking on a helper thread"
        );
        std::thread::Builder::new()
            .name("accelrt-release".into())
            .spawn(run)?
            .join()
            .map_err(|_| AccelError::InternalFailure(format!("{}: release thread panicked", what)))?
    }
}

fn proxy_unsupported<T>(what: &str) -> Result<T> {
    Err(AccelError::InvalidOperation(format!(
        "{} is not supported on a network group owned by the service; use vstreams instead",
        what
    )))
}

// ----- NetworkGroupClient -----

/// A network group living in the service process.
///
/// Share it as an `Arc`: dropping the last reference releases the remote
/// handle exactly once.
pub struct NetworkGroupClient {
    conn: Connection,
    identifier: Mutex<NetworkGroupIdentifier>,
    name: String,
}

impl std::fmt::Debug for NetworkGroupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGroupClient")
            .field("name", &self.name)
            .field("identifier", &*self.identifier.lock())
            .finish_non_exhaustive()
    }
}

impl NetworkGroupClient {
    /// Attach to a network group already published for this process.
    pub fn create(identifier: NetworkGroupIdentifier) -> Result<Arc<Self>> {
        Self::create_at(&service_addr(), identifier)
    }

    pub fn create_at(addr: &str, identifier: NetworkGroupIdentifier) -> Result<Arc<Self>> {
        let conn = Connection::open(addr)?;
        let name = conn.with(|client| client.network_group_name(identifier))?;
        tracing::debug!(core_op = %name, handle = identifier.network_group_handle, "Attached to remote network group");
        Ok(Arc::new(Self {
            conn,
            identifier: Mutex::new(identifier),
            name,
        }))
    }

    /// Take an extra reference on a remote network group for this process.
    pub fn duplicate_network_group_client(
        network_group_handle: u32,
        vdevice_handle: u32,
        name: &str,
    ) -> Result<Arc<Self>> {
        Self::duplicate_at(&service_addr(), network_group_handle, vdevice_handle, name)
    }

    pub fn duplicate_at(
        addr: &str,
        network_group_handle: u32,
        vdevice_handle: u32,
        name: &str,
    ) -> Result<Arc<Self>> {
        let conn = Connection::open(addr)?;
        let identifier = NetworkGroupIdentifier {
            network_group_handle,
            vdevice_handle,
        };
        let handle = conn.with(|client| client.network_group_dup_handle(identifier, conn.pid()))?;
        Ok(Arc::new(Self {
            conn,
            identifier: Mutex::new(NetworkGroupIdentifier {
                network_group_handle: handle,
                vdevice_handle,
            }),
            name: name.to_string(),
        }))
    }

    pub fn identifier(&self) -> NetworkGroupIdentifier {
        *self.identifier.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.conn.pid()
    }

    // ----- fork hooks -----

    pub fn before_fork(&self) {
        self.conn.disconnect();
    }

    pub fn after_fork_in_parent(&self) -> Result<()> {
        self.conn.reconnect()
    }

    /// Reconnect from the child and take a reference for the child's pid.
    pub fn after_fork_in_child(&self) -> Result<()> {
        let pid = self.conn.reconnect_as_child()?;
        let identifier = self.identifier();
        let handle = self
            .conn
            .with(|client| client.network_group_dup_handle(identifier, pid))?;
        self.identifier.lock().network_group_handle = handle;
        Ok(())
    }

    // ----- control plane -----

    pub fn get_network_infos(&self) -> Result<Vec<NetworkInfo>> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_network_infos(identifier))
    }

    pub fn get_all_stream_infos(&self, network_name: &str) -> Result<Vec<StreamInfo>> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_all_stream_infos(identifier, network_name))
    }

    pub fn get_default_streams_interface(&self) -> Result<StreamInterface> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_default_stream_interface(identifier))
    }

    pub fn is_scheduled(&self) -> Result<bool> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_is_scheduled(identifier))
    }

    pub fn set_scheduler_timeout(&self, timeout: Duration, network_name: &str) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| {
            client.network_group_set_scheduler_timeout(identifier, timeout, network_name)
        })
    }

    pub fn set_scheduler_threshold(&self, threshold: u32, network_name: &str) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| {
            client.network_group_set_scheduler_threshold(identifier, threshold, network_name)
        })
    }

    pub fn set_scheduler_priority(&self, priority: u8, network_name: &str) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| {
            client.network_group_set_scheduler_priority(identifier, priority, network_name)
        })
    }

    pub fn get_latency_measurement(&self, network_name: &str) -> Result<LatencyMeasurementResult> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_latency_measurement(identifier, network_name))
    }

    pub fn is_multi_context(&self) -> Result<bool> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_is_multi_context(identifier))
    }

    pub fn get_config_params(&self) -> Result<ConfigureNetworkParams> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_config_params(identifier))
    }

    pub fn get_input_vstream_infos(&self, network_name: &str) -> Result<Vec<VStreamInfo>> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_input_vstream_infos(identifier, network_name))
    }

    pub fn get_output_vstream_infos(&self, network_name: &str) -> Result<Vec<VStreamInfo>> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.network_group_get_output_vstream_infos(identifier, network_name))
    }

    pub fn create_input_vstreams(
        &self,
        params: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<InputVStreamClient>> {
        let identifier = self.identifier();
        let pid = self.pid();
        let handles = self
            .conn
            .with(|client| client.input_vstreams_create(identifier, pid, params))?;
        handles
            .into_iter()
            .map(|handle| InputVStreamClient::attach(&self.conn.addr, vstream_identifier(identifier, handle)))
            .collect()
    }

    pub fn create_output_vstreams(
        &self,
        params: &BTreeMap<String, VStreamParams>,
    ) -> Result<Vec<OutputVStreamClient>> {
        let identifier = self.identifier();
        let pid = self.pid();
        let handles = self
            .conn
            .with(|client| client.output_vstreams_create(identifier, pid, params))?;
        handles
            .into_iter()
            .map(|handle| OutputVStreamClient::attach(&self.conn.addr, vstream_identifier(identifier, handle)))
            .collect()
    }

    // ----- data plane: not available through the proxy -----

    pub fn activate(&self, _dynamic_batch_size: u16) -> Result<()> {
        proxy_unsupported("activate")
    }

    pub fn wait_for_activation(&self, _timeout: Duration) -> Result<()> {
        proxy_unsupported("wait_for_activation")
    }

    pub fn get_input_streams(&self) -> Result<Vec<InputStreamPtr>> {
        proxy_unsupported("get_input_streams")
    }

    pub fn get_output_streams(&self) -> Result<Vec<OutputStreamPtr>> {
        proxy_unsupported("get_output_streams")
    }

    pub fn get_input_stream_by_name(&self, _name: &str) -> Result<InputStreamPtr> {
        proxy_unsupported("get_input_stream_by_name")
    }

    pub fn get_output_stream_by_name(&self, _name: &str) -> Result<OutputStreamPtr> {
        proxy_unsupported("get_output_stream_by_name")
    }

    pub fn get_activation_time_accumulator(&self) -> Result<AccumulatorPtr> {
        proxy_unsupported("get_activation_time_accumulator")
    }

    pub fn get_deactivation_time_accumulator(&self) -> Result<AccumulatorPtr> {
        proxy_unsupported("get_deactivation_time_accumulator")
    }

    pub fn get_intermediate_buffer(&self, _context_index: u16, _stream_index: u8) -> Result<Vec<u8>> {
        proxy_unsupported("get_intermediate_buffer")
    }
}

impl Drop for NetworkGroupClient {
    fn drop(&mut self) {
        let identifier = *self.identifier.get_mut();
        let pid = self.conn.pid();
        let result = self.conn.release("NetworkGroupRelease", move |client| {
            client.network_group_release(identifier, pid)
        });
        if let Err(e) = result {
            tracing::error!(
                critical = true,
                core_op = %self.name,
                handle = identifier.network_group_handle,
                error = %e,
                "Failed to release remote network group"
            );
        }
    }
}

fn vstream_identifier(identifier: NetworkGroupIdentifier, vstream_handle: u32) -> VStreamIdentifier {
    VStreamIdentifier {
        vstream_handle,
        network_group_handle: identifier.network_group_handle,
        vdevice_handle: identifier.vdevice_handle,
    }
}

// ----- vstream clients -----

/// An input vstream living in the service process.
pub struct InputVStreamClient {
    conn: Connection,
    identifier: Mutex<VStreamIdentifier>,
    name: String,
    network_name: String,
    frame_size: usize,
}

impl InputVStreamClient {
    fn attach(addr: &str, identifier: VStreamIdentifier) -> Result<Self> {
        let conn = Connection::open(addr)?;
        let (name, network_name, frame_size) = conn.with(|client| {
            Ok((
                client.input_vstream_name(identifier)?,
                client.input_vstream_network_name(identifier)?,
                client.input_vstream_get_frame_size(identifier)?,
            ))
        })?;
        Ok(Self {
            conn,
            identifier: Mutex::new(identifier),
            name,
            network_name,
            frame_size,
        })
    }

    /// Another client on the same remote vstream, holding its own reference.
    pub fn duplicate(&self) -> Result<Self> {
        let identifier = self.identifier();
        let handle = self
            .conn
            .with(|client| client.input_vstream_dup_handle(identifier, self.conn.pid()))?;
        Self::attach(&self.conn.addr, VStreamIdentifier {
            vstream_handle: handle,
            ..identifier
        })
    }

    pub fn identifier(&self) -> VStreamIdentifier {
        *self.identifier.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn get_frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn write(&self, frame: &[u8]) -> Result<()> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.input_vstream_write(identifier, frame))
    }

    pub fn abort(&self) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| client.input_vstream_abort(identifier))
    }

    pub fn resume(&self) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| client.input_vstream_resume(identifier))
    }

    pub fn is_aborted(&self) -> Result<bool> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.input_vstream_is_aborted(identifier))
    }

    pub fn before_fork(&self) {
        self.conn.disconnect();
    }

    pub fn after_fork_in_parent(&self) -> Result<()> {
        self.conn.reconnect()
    }

    pub fn after_fork_in_child(&self) -> Result<()> {
        let pid = self.conn.reconnect_as_child()?;
        let identifier = self.identifier();
        let handle = self
            .conn
            .with(|client| client.input_vstream_dup_handle(identifier, pid))?;
        self.identifier.lock().vstream_handle = handle;
        Ok(())
    }
}

impl Drop for InputVStreamClient {
    fn drop(&mut self) {
        let identifier = *self.identifier.get_mut();
        let pid = self.conn.pid();
        let result = self.conn.release("InputVStreamRelease", move |client| {
            client.input_vstream_release(identifier, pid)
        });
        if let Err(e) = result {
            tracing::error!(
                critical = true,
                vstream = %self.name,
                handle = identifier.vstream_handle,
                error = %e,
                "Failed to release remote input vstream"
            );
        }
    }
}

/// An output vstream living in the service process.
pub struct OutputVStreamClient {
    conn: Connection,
    identifier: Mutex<VStreamIdentifier>,
    name: String,
    network_name: String,
    frame_size: usize,
}

impl OutputVStreamClient {
    fn attach(addr: &str, identifier: VStreamIdentifier) -> Result<Self> {
        let conn = Connection::open(addr)?;
        let (name, network_name, frame_size) = conn.with(|client| {
            Ok((
                client.output_vstream_name(identifier)?,
                client.output_vstream_network_name(identifier)?,
                client.output_vstream_get_frame_size(identifier)?,
            ))
        })?;
        Ok(Self {
            conn,
            identifier: Mutex::new(identifier),
            name,
            network_name,
            frame_size,
        })
    }

    /// Another client on the same remote vstream, holding its own reference.
    pub fn duplicate(&self) -> Result<Self> {
        let identifier = self.identifier();
        let handle = self
            .conn
            .with(|client| client.output_vstream_dup_handle(identifier, self.conn.pid()))?;
        Self::attach(&self.conn.addr, VStreamIdentifier {
            vstream_handle: handle,
            ..identifier
        })
    }

    pub fn identifier(&self) -> VStreamIdentifier {
        *self.identifier.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn get_frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn read(&self, frame: &mut [u8]) -> Result<()> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.output_vstream_read(identifier, frame))
    }

    pub fn abort(&self) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| client.output_vstream_abort(identifier))
    }

    pub fn resume(&self) -> Result<()> {
        let identifier = self.identifier();
        self.conn.with(|client| client.output_vstream_resume(identifier))
    }

    pub fn is_aborted(&self) -> Result<bool> {
        let identifier = self.identifier();
        self.conn
            .with(|client| client.output_vstream_is_aborted(identifier))
    }

    pub fn before_fork(&self) {
        self.conn.disconnect();
    }

    pub fn after_fork_in_parent(&self) -> Result<()> {
        self.conn.reconnect()
    }

    pub fn after_fork_in_child(&self) -> Result<()> {
        let pid = self.conn.reconnect_as_child()?;
        let identifier = self.identifier();
        let handle = self
            .conn
            .with(|client| client.output_vstream_dup_handle(identifier, pid))?;
        self.identifier.lock().vstream_handle = handle;
        Ok(())
    }
}

impl Drop for OutputVStreamClient {
    fn drop(&mut self) {
        let identifier = *self.identifier.get_mut();
        let pid = self.conn.pid();
        let result = self.conn.release("OutputVStreamRelease", move |client| {
            client.output_vstream_release(identifier, pid)
        });
        if let Err(e) = result {
            tracing::error!(
                critical = true,
                vstream = %self.name,
                handle = identifier.vstream_handle,
                error = %e,
                "Failed to release remote output vstream"
            );
        }
    }
}

// ----- keep-alive -----

/// Background thread sending `KeepAlive(pid)` until dropped.
pub struct KeepAliveThread {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAliveThread {
    pub fn start(addr: &str, pid: u32, interval: Duration) -> Result<Self> {
        let client = RpcClient::connect(addr)?;
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("accelrt-keepalive".into())
            .spawn(move || {
                loop {
                    if let Err(e) = client.keep_alive(pid) {
                        tracing::warn!(pid, error = %e, "Keep-alive failed");
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(pid, "Keep-alive thread stopped");
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for KeepAliveThread {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Keep-alive thread panicked");
            }
        }
    }
}
