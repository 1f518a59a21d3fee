// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wire messages of the `accelrt.rpc.CoreOpRpc` service.
//!
//! Every reply carries a `status` field holding an [`accelrt::Status`]
//! code. Structured payloads (stream infos, configure params) travel as
//! JSON strings.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/accelrt.rpc.CoreOpRpc.rs"));

/// Largest message either side encodes or decodes. Bounds one vstream frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

// ----- identifiers -----

/// Remote address of a configured network group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct NetworkGroupIdentifier {
    #[prost(uint32, tag = "1")]
    pub network_group_handle: u32,
    #[prost(uint32, tag = "2")]
    pub vdevice_handle: u32,
}

/// Remote address of a vstream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct VStreamIdentifier {
    #[prost(uint32, tag = "1")]
    pub vstream_handle: u32,
    #[prost(uint32, tag = "2")]
    pub network_group_handle: u32,
    #[prost(uint32, tag = "3")]
    pub vdevice_handle: u32,
}

// ----- requests -----

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct KeepAliveRequest {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GetServiceVersionRequest {}

/// Duplicate or release a network group handle on behalf of `pid`.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct NetworkGroupHandleRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
}

/// Control-plane query. `network_name` is empty when the call targets
/// every network of the group.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkGroupRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(string, tag = "2")]
    pub network_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetSchedulerTimeoutRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(uint32, tag = "2")]
    pub timeout_ms: u32,
    #[prost(string, tag = "3")]
    pub network_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetSchedulerThresholdRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(uint32, tag = "2")]
    pub threshold: u32,
    #[prost(string, tag = "3")]
    pub network_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetSchedulerPriorityRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(uint32, tag = "2")]
    pub priority: u32,
    #[prost(string, tag = "3")]
    pub network_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VStreamParamsEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub timeout_ms: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VStreamsCreateRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<NetworkGroupIdentifier>,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    #[prost(message, repeated, tag = "3")]
    pub params: Vec<VStreamParamsEntry>,
}

/// Duplicate or release a vstream handle on behalf of `pid`.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VStreamHandleRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<VStreamIdentifier>,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VStreamRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<VStreamIdentifier>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InputVStreamWriteRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<VStreamIdentifier>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct OutputVStreamReadRequest {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<VStreamIdentifier>,
    #[prost(uint32, tag = "2")]
    pub size: u32,
}

// ----- replies -----

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StatusReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetServiceVersionReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HandleReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct BoolReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(bool, tag = "2")]
    pub value: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct U32Reply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(uint32, tag = "2")]
    pub value: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JsonReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(string, tag = "2")]
    pub json: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkInfosReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(string, repeated, tag = "2")]
    pub network_names: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LatencyMeasurementReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(uint64, tag = "2")]
    pub avg_hw_latency_ns: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VStreamsCreateReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub handles: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputVStreamReadReply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}
