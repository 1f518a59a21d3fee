// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! gRPC service exposing published core-ops and their vstreams to other
//! processes.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use accelrt::error::status_of;
use accelrt::{AccelError, Result, Status as AccelStatus, VStreamParams};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::proto::core_op_rpc_server::{CoreOpRpc, CoreOpRpcServer};
use crate::proto::{
    BoolReply, GetServiceVersionReply, GetServiceVersionRequest, HandleReply,
    InputVStreamWriteRequest, JsonReply, KeepAliveRequest, LatencyMeasurementReply, MAX_MESSAGE_SIZE,
    NetworkGroupHandleRequest, NetworkGroupIdentifier, NetworkGroupRequest, NetworkInfosReply,
    OutputVStreamReadReply, OutputVStreamReadRequest, SetSchedulerPriorityRequest,
    SetSchedulerThresholdRequest, SetSchedulerTimeoutRequest, StatusReply, StringReply, U32Reply,
    VStreamHandleRequest, VStreamIdentifier, VStreamRequest, VStreamsCreateReply,
    VStreamsCreateRequest,
};
pub use crate::state::{HandleTable, ServiceState};

/// Current protocol version. Bump when the RPC surface changes.
pub const PROTOCOL_VERSION: u32 = 1;

type RpcResult<T> = std::result::Result<Response<T>, Status>;

/// gRPC front end over a [`ServiceState`].
pub struct CoreOpRpcService {
    state: ServiceState,
}

impl CoreOpRpcService {
    pub fn new(state: ServiceState) -> Self {
        Self { state }
    }

    pub fn into_server(self) -> CoreOpRpcServer<Self> {
        CoreOpRpcServer::new(self)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE)
    }
}

// ----- reply construction -----

fn code<T>(result: &Result<T>) -> u32 {
    if let Err(e) = result {
        tracing::debug!(error = %e, "[Service] Call failed");
    }
    status_of(result).code()
}

impl From<Result<()>> for StatusReply {
    fn from(result: Result<()>) -> Self {
        Self {
            status: code(&result),
        }
    }
}

impl From<Result<u32>> for HandleReply {
    fn from(result: Result<u32>) -> Self {
        Self {
            status: code(&result),
            handle: result.unwrap_or_default(),
        }
    }
}

impl From<Result<String>> for StringReply {
    fn from(result: Result<String>) -> Self {
        Self {
            status: code(&result),
            value: result.unwrap_or_default(),
        }
    }
}

impl From<Result<bool>> for BoolReply {
    fn from(result: Result<bool>) -> Self {
        Self {
            status: code(&result),
            value: result.unwrap_or_default(),
        }
    }
}

impl From<Result<u32>> for U32Reply {
    fn from(result: Result<u32>) -> Self {
        Self {
            status: code(&result),
            value: result.unwrap_or_default(),
        }
    }
}

impl From<Result<String>> for JsonReply {
    fn from(result: Result<String>) -> Self {
        Self {
            status: code(&result),
            json: result.unwrap_or_default(),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AccelError::InternalFailure(format!("failed to encode reply: {}", e)))
}

fn network_group_id(identifier: Option<NetworkGroupIdentifier>) -> Result<NetworkGroupIdentifier> {
    identifier.ok_or_else(|| AccelError::InvalidArgument("missing network group identifier".into()))
}

fn vstream_id(identifier: Option<VStreamIdentifier>) -> Result<VStreamIdentifier> {
    identifier.ok_or_else(|| AccelError::InvalidArgument("missing vstream identifier".into()))
}

fn frame_size(size: usize) -> Result<u32> {
    u32::try_from(size)
        .map_err(|_| AccelError::InternalFailure(format!("frame size {} does not fit the wire", size)))
}

/// Requested read length, which must be exactly one frame.
fn check_read_size(requested: u32, frame_size: usize) -> Result<usize> {
    match usize::try_from(requested) {
        Ok(size) if size == frame_size => Ok(size),
        _ => Err(AccelError::InvalidArgument(format!(
            "read of {} bytes from a vstream with {} byte frames",
            requested, frame_size
        ))),
    }
}

/// Run a blocking vstream transfer off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AccelError::InternalFailure(format!("transfer task failed: {}", e)))?
}

impl CoreOpRpcService {
    fn network_group_query<T>(
        &self,
        request: &NetworkGroupRequest,
        query: impl FnOnce(&accelrt::CoreOp, &str) -> Result<T>,
    ) -> Result<T> {
        let core_op = self.state.network_group(&network_group_id(request.identifier)?)?;
        query(core_op.as_ref(), &request.network_name)
    }

    fn create_vstreams(&self, request: VStreamsCreateRequest, input: bool) -> VStreamsCreateReply {
        self.state.update_client_timestamp(request.pid);
        let result: Result<Vec<u32>> = (|| {
            let identifier = network_group_id(request.identifier)?;
            let core_op = self.state.network_group(&identifier)?;
            let params: BTreeMap<String, VStreamParams> = request
                .params
                .into_iter()
                .map(|entry| {
                    (
                        entry.name,
                        VStreamParams {
                            timeout_ms: entry.timeout_ms,
                        },
                    )
                })
                .collect();
            Ok(if input {
                let vstreams = core_op.create_input_vstreams(&params)?;
                self.state
                    .register_input_vstreams(&identifier, vstreams, request.pid)
            } else {
                let vstreams = core_op.create_output_vstreams(&params)?;
                self.state
                    .register_output_vstreams(&identifier, vstreams, request.pid)
            })
        })();
        VStreamsCreateReply {
            status: code(&result),
            handles: result.unwrap_or_default(),
        }
    }
}

#[tonic::async_trait]
impl CoreOpRpc for CoreOpRpcService {
    async fn keep_alive(&self, request: Request<KeepAliveRequest>) -> RpcResult<StatusReply> {
        self.state.update_client_timestamp(request.get_ref().pid);
        Ok(Response::new(StatusReply {
            status: AccelStatus::Success.code(),
        }))
    }

    async fn get_service_version(
        &self,
        _request: Request<GetServiceVersionRequest>,
    ) -> RpcResult<GetServiceVersionReply> {
        Ok(Response::new(GetServiceVersionReply {
            status: AccelStatus::Success.code(),
            version: crate::VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }))
    }

    // ----- network groups -----

    async fn network_group_dup_handle(
        &self,
        request: Request<NetworkGroupHandleRequest>,
    ) -> RpcResult<HandleReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = network_group_id(request.identifier)
            .and_then(|identifier| self.state.dup_network_group(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    async fn network_group_release(
        &self,
        request: Request<NetworkGroupHandleRequest>,
    ) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = network_group_id(request.identifier)
            .and_then(|identifier| self.state.release_network_group(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    async fn network_group_name(&self, request: Request<NetworkGroupRequest>) -> RpcResult<StringReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| {
            Ok(core_op.name().to_string())
        });
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_network_infos(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<NetworkInfosReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| {
            Ok(core_op
                .get_network_infos()
                .into_iter()
                .map(|info| info.name)
                .collect::<Vec<_>>())
        });
        Ok(Response::new(NetworkInfosReply {
            status: code(&result),
            network_names: result.unwrap_or_default(),
        }))
    }

    async fn network_group_get_all_stream_infos(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<JsonReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, network_name| {
            to_json(&core_op.get_all_stream_infos(network_name)?)
        });
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_default_stream_interface(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<U32Reply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| {
            Ok(core_op.get_default_streams_interface()?.as_u32())
        });
        Ok(Response::new(result.into()))
    }

    async fn network_group_is_scheduled(&self, request: Request<NetworkGroupRequest>) -> RpcResult<BoolReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| Ok(core_op.is_scheduled()));
        Ok(Response::new(result.into()))
    }

    async fn network_group_set_scheduler_timeout(
        &self,
        request: Request<SetSchedulerTimeoutRequest>,
    ) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        let result = network_group_id(request.identifier)
            .and_then(|identifier| self.state.network_group(&identifier))
            .and_then(|core_op| {
                core_op.set_scheduler_timeout(
                    Duration::from_millis(u64::from(request.timeout_ms)),
                    &request.network_name,
                )
            });
        Ok(Response::new(result.into()))
    }

    async fn network_group_set_scheduler_threshold(
        &self,
        request: Request<SetSchedulerThresholdRequest>,
    ) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        let result = network_group_id(request.identifier)
            .and_then(|identifier| self.state.network_group(&identifier))
            .and_then(|core_op| core_op.set_scheduler_threshold(request.threshold, &request.network_name));
        Ok(Response::new(result.into()))
    }

    async fn network_group_set_scheduler_priority(
        &self,
        request: Request<SetSchedulerPriorityRequest>,
    ) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        let result = network_group_id(request.identifier)
            .and_then(|identifier| self.state.network_group(&identifier))
            .and_then(|core_op| {
                let priority = u8::try_from(request.priority).map_err(|_| {
                    AccelError::InvalidArgument(format!("priority {} out of range", request.priority))
                })?;
                core_op.set_scheduler_priority(priority, &request.network_name)
            });
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_latency_measurement(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<LatencyMeasurementReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, network_name| {
            core_op.get_latency_measurement(network_name)
        });
        Ok(Response::new(LatencyMeasurementReply {
            status: code(&result),
            avg_hw_latency_ns: result
                .map(|measurement| {
                    u64::try_from(measurement.avg_hw_latency.as_nanos()).unwrap_or(u64::MAX)
                })
                .unwrap_or_default(),
        }))
    }

    async fn network_group_is_multi_context(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<BoolReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| Ok(core_op.is_multi_context()));
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_config_params(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<JsonReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, _| {
            core_op.get_config_params().to_json_string()
        });
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_input_vstream_infos(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<JsonReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, network_name| {
            to_json(&core_op.get_input_vstream_infos(network_name)?)
        });
        Ok(Response::new(result.into()))
    }

    async fn network_group_get_output_vstream_infos(
        &self,
        request: Request<NetworkGroupRequest>,
    ) -> RpcResult<JsonReply> {
        let result = self.network_group_query(request.get_ref(), |core_op, network_name| {
            to_json(&core_op.get_output_vstream_infos(network_name)?)
        });
        Ok(Response::new(result.into()))
    }

    // ----- vstream lifetime -----

    async fn input_vstreams_create(
        &self,
        request: Request<VStreamsCreateRequest>,
    ) -> RpcResult<VStreamsCreateReply> {
        Ok(Response::new(self.create_vstreams(request.into_inner(), true)))
    }

    async fn output_vstreams_create(
        &self,
        request: Request<VStreamsCreateRequest>,
    ) -> RpcResult<VStreamsCreateReply> {
        Ok(Response::new(self.create_vstreams(request.into_inner(), false)))
    }

    async fn input_vstream_dup_handle(&self, request: Request<VStreamHandleRequest>) -> RpcResult<HandleReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = vstream_id(request.identifier)
            .and_then(|identifier| self.state.dup_input_vstream(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_dup_handle(&self, request: Request<VStreamHandleRequest>) -> RpcResult<HandleReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = vstream_id(request.identifier)
            .and_then(|identifier| self.state.dup_output_vstream(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_release(&self, request: Request<VStreamHandleRequest>) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = vstream_id(request.identifier)
            .and_then(|identifier| self.state.release_input_vstream(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_release(&self, request: Request<VStreamHandleRequest>) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        self.state.update_client_timestamp(request.pid);
        let result = vstream_id(request.identifier)
            .and_then(|identifier| self.state.release_output_vstream(&identifier, request.pid));
        Ok(Response::new(result.into()))
    }

    // ----- vstream data -----

    async fn input_vstream_write(&self, request: Request<InputVStreamWriteRequest>) -> RpcResult<StatusReply> {
        let request = request.into_inner();
        let result = match vstream_id(request.identifier).and_then(|id| self.state.input_vstream(&id)) {
            Ok(entry) => blocking(move || entry.vstream.write(&request.data)).await,
            Err(e) => Err(e),
        };
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_read(
        &self,
        request: Request<OutputVStreamReadRequest>,
    ) -> RpcResult<OutputVStreamReadReply> {
        let request = request.into_inner();
        let result = match vstream_id(request.identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .and_then(|entry| {
                let size = check_read_size(request.size, entry.vstream.get_frame_size())?;
                Ok((entry, size))
            })
        {
            Ok((entry, size)) => {
                blocking(move || {
                    let mut frame = vec![0u8; size];
                    entry.vstream.read(&mut frame)?;
                    Ok(frame)
                })
                .await
            }
            Err(e) => Err(e),
        };
        Ok(Response::new(OutputVStreamReadReply {
            status: code(&result),
            data: result.unwrap_or_default(),
        }))
    }

    // ----- vstream queries -----

    async fn input_vstream_get_frame_size(&self, request: Request<VStreamRequest>) -> RpcResult<U32Reply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .and_then(|entry| frame_size(entry.vstream.get_frame_size()));
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_get_frame_size(&self, request: Request<VStreamRequest>) -> RpcResult<U32Reply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .and_then(|entry| frame_size(entry.vstream.get_frame_size()));
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_name(&self, request: Request<VStreamRequest>) -> RpcResult<StringReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .map(|entry| entry.vstream.name().to_string());
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_name(&self, request: Request<VStreamRequest>) -> RpcResult<StringReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .map(|entry| entry.vstream.name().to_string());
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_network_name(&self, request: Request<VStreamRequest>) -> RpcResult<StringReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .map(|entry| entry.vstream.network_name().to_string());
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_network_name(&self, request: Request<VStreamRequest>) -> RpcResult<StringReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .map(|entry| entry.vstream.network_name().to_string());
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_abort(&self, request: Request<VStreamRequest>) -> RpcResult<StatusReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .and_then(|entry| entry.vstream.abort());
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_abort(&self, request: Request<VStreamRequest>) -> RpcResult<StatusReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .and_then(|entry| entry.vstream.abort());
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_resume(&self, request: Request<VStreamRequest>) -> RpcResult<StatusReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .and_then(|entry| entry.vstream.resume());
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_resume(&self, request: Request<VStreamRequest>) -> RpcResult<StatusReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .and_then(|entry| entry.vstream.resume());
        Ok(Response::new(result.into()))
    }

    async fn input_vstream_is_aborted(&self, request: Request<VStreamRequest>) -> RpcResult<BoolReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.input_vstream(&id))
            .map(|entry| entry.vstream.is_aborted());
        Ok(Response::new(result.into()))
    }

    async fn output_vstream_is_aborted(&self, request: Request<VStreamRequest>) -> RpcResult<BoolReply> {
        let result = vstream_id(request.get_ref().identifier)
            .and_then(|id| self.state.output_vstream(&id))
            .map(|entry| entry.vstream.is_aborted());
        Ok(Response::new(result.into()))
    }
}

// ----- background tasks and server -----

/// Periodically reap clients that stopped sending keep-alives.
pub fn spawn_reaper(state: ServiceState, interval: Duration, window: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = state.remove_disconnected_clients(window);
            if !reaped.is_empty() {
                tracing::info!("[Service] Reaped {} disconnected client(s): {:?}", reaped.len(), reaped);
            }
        }
    })
}

/// Serve on `addr` until `shutdown` resolves.
pub async fn serve(
    state: ServiceState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("[Service] Starting gRPC server on {}", listener.local_addr()?);
    serve_with_listener(state, listener, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_listener(
    state: ServiceState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    Server::builder()
        .add_service(CoreOpRpcService::new(state).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    tracing::info!("[Service] gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_carries_status_code() {
        let reply = StatusReply::from(Err::<(), _>(AccelError::Timeout("slow".into())));
        assert_eq!(reply.status, AccelStatus::Timeout.code());

        let reply = BoolReply::from(Ok::<_, AccelError>(true));
        assert_eq!(reply.status, 0);
        assert!(reply.value);

        let reply = HandleReply::from(Err::<u32, _>(AccelError::NotFound("gone".into())));
        assert_eq!(reply.status, AccelStatus::NotFound.code());
        assert_eq!(reply.handle, 0);
    }

    #[test]
    fn test_read_size_must_match_frame() {
        assert_eq!(check_read_size(16, 16).unwrap(), 16);
        assert!(matches!(
            check_read_size(u32::MAX, 16),
            Err(AccelError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_read_size(0, 16),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_identifier_is_invalid_argument() {
        let service = CoreOpRpcService::new(ServiceState::new());
        let reply = service
            .network_group_name(Request::new(NetworkGroupRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status, AccelStatus::InvalidArgument.code());

        let reply = service
            .input_vstream_abort(Request::new(VStreamRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status, AccelStatus::InvalidArgument.code());
    }

    #[tokio::test]
    async fn test_keep_alive_registers_client() {
        let state = ServiceState::new();
        let service = CoreOpRpcService::new(state.clone());
        service
            .keep_alive(Request::new(KeepAliveRequest { pid: 42 }))
            .await
            .unwrap();
        assert!(state.is_client_alive(42));
    }

    #[tokio::test]
    async fn test_version_reports_crate_version() {
        let service = CoreOpRpcService::new(ServiceState::new());
        let reply = service
            .get_service_version(Request::new(GetServiceVersionRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.version, crate::VERSION);
        assert_eq!(reply.protocol_version, PROTOCOL_VERSION);
    }
}
