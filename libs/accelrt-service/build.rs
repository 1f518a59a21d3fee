// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use tonic_build::manual::{Builder, Method, Service};

/// (method, route, request, reply)
const METHODS: &[(&str, &str, &str, &str)] = &[
    ("keep_alive", "KeepAlive", "KeepAliveRequest", "StatusReply"),
    ("get_service_version", "GetServiceVersion", "GetServiceVersionRequest", "GetServiceVersionReply"),
    ("network_group_dup_handle", "NetworkGroupDupHandle", "NetworkGroupHandleRequest", "HandleReply"),
    ("network_group_release", "NetworkGroupRelease", "NetworkGroupHandleRequest", "StatusReply"),
    ("network_group_name", "NetworkGroupName", "NetworkGroupRequest", "StringReply"),
    ("network_group_get_network_infos", "NetworkGroupGetNetworkInfos", "NetworkGroupRequest", "NetworkInfosReply"),
    ("network_group_get_all_stream_infos", "NetworkGroupGetAllStreamInfos", "NetworkGroupRequest", "JsonReply"),
    ("network_group_get_default_stream_interface", "NetworkGroupGetDefaultStreamInterface", "NetworkGroupRequest", "U32Reply"),
    ("network_group_is_scheduled", "NetworkGroupIsScheduled", "NetworkGroupRequest", "BoolReply"),
    ("network_group_set_scheduler_timeout", "NetworkGroupSetSchedulerTimeout", "SetSchedulerTimeoutRequest", "StatusReply"),
    ("network_group_set_scheduler_threshold", "NetworkGroupSetSchedulerThreshold", "SetSchedulerThresholdRequest", "StatusReply"),
    ("network_group_set_scheduler_priority", "NetworkGroupSetSchedulerPriority", "SetSchedulerPriorityRequest", "StatusReply"),
    ("network_group_get_latency_measurement", "NetworkGroupGetLatencyMeasurement", "NetworkGroupRequest", "LatencyMeasurementReply"),
    ("network_group_is_multi_context", "NetworkGroupIsMultiContext", "NetworkGroupRequest", "BoolReply"),
    ("network_group_get_config_params", "NetworkGroupGetConfigParams", "NetworkGroupRequest", "JsonReply"),
    ("network_group_get_input_vstream_infos", "NetworkGroupGetInputVStreamInfos", "NetworkGroupRequest", "JsonReply"),
    ("network_group_get_output_vstream_infos", "NetworkGroupGetOutputVStreamInfos", "NetworkGroupRequest", "JsonReply"),
    ("input_vstreams_create", "InputVStreamsCreate", "VStreamsCreateRequest", "VStreamsCreateReply"),
    ("output_vstreams_create", "OutputVStreamsCreate", "VStreamsCreateRequest", "VStreamsCreateReply"),
    ("input_vstream_dup_handle", "InputVStreamDupHandle", "VStreamHandleRequest", "HandleReply"),
    ("output_vstream_dup_handle", "OutputVStreamDupHandle", "VStreamHandleRequest", "HandleReply"),
    ("input_vstream_release", "InputVStreamRelease", "VStreamHandleRequest", "StatusReply"),
    ("output_vstream_release", "OutputVStreamRelease", "VStreamHandleRequest", "StatusReply"),
    ("input_vstream_write", "InputVStreamWrite", "InputVStreamWriteRequest", "StatusReply"),
    ("output_vstream_read", "OutputVStreamRead", "OutputVStreamReadRequest", "OutputVStreamReadReply"),
    ("input_vstream_get_frame_size", "InputVStreamGetFrameSize", "VStreamRequest", "U32Reply"),
    ("output_vstream_get_frame_size", "OutputVStreamGetFrameSize", "VStreamRequest", "U32Reply"),
    ("input_vstream_name", "InputVStreamName", "VStreamRequest", "StringReply"),
    ("output_vstream_name", "OutputVStreamName", "VStreamRequest", "StringReply"),
    ("input_vstream_network_name", "InputVStreamNetworkName", "VStreamRequest", "StringReply"),
    ("output_vstream_network_name", "OutputVStreamNetworkName", "VStreamRequest", "StringReply"),
    ("input_vstream_abort", "InputVStreamAbort", "VStreamRequest", "StatusReply"),
    ("output_vstream_abort", "OutputVStreamAbort", "VStreamRequest", "StatusReply"),
    ("input_vstream_resume", "InputVStreamResume", "VStreamRequest", "StatusReply"),
    ("output_vstream_resume", "OutputVStreamResume", "VStreamRequest", "StatusReply"),
    ("input_vstream_is_aborted", "InputVStreamIsAborted", "VStreamRequest", "BoolReply"),
    ("output_vstream_is_aborted", "OutputVStreamIsAborted", "VStreamRequest", "BoolReply"),
];

fn main() {
    // Messages are declared by hand in src/proto.rs, so no protoc is needed.
    let service = METHODS.iter().fold(
        Service::builder().name("CoreOpRpc").package("accelrt.rpc"),
        |service, (name, route, request, reply)| {
            service.method(
                Method::builder()
                    .name(name)
                    .route_name(route)
                    .input_type(format!("crate::proto::{}", request))
                    .output_type(format!("crate::proto::{}", reply))
                    .codec_path("tonic::codec::ProstCodec")
                    .build(),
            )
        },
    );

    Builder::new().compile(&[service.build()]);
}
