// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Client proxies against a live service on loopback.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use accelrt::{AccelError, DEFAULT_BATCH_SIZE, SchedulerParams, StreamInterface, VStreamParams};
use accelrt_service::{KeepAliveThread, NetworkGroupClient, RpcClient, VStreamIdentifier};

use common::{FRAME_SIZE, INPUT, OUTPUT, TestService, loopback_core_op};

fn params(name: &str) -> BTreeMap<String, VStreamParams> {
    BTreeMap::from([(name.to_string(), VStreamParams { timeout_ms: 1000 })])
}

#[test]
fn test_control_plane_queries() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(1, loopback.core_op.clone(), std::process::id());

    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();
    assert_eq!(ng.name(), "resnet");

    let networks = ng.get_network_infos().unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].name, "net");

    let infos = ng.get_all_stream_infos("").unwrap();
    assert_eq!(infos.len(), 2);
    assert!(matches!(
        ng.get_all_stream_infos("missing"),
        Err(AccelError::NotFound(_))
    ));
    let inputs = ng.get_input_vstream_infos("net").unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].name, INPUT);
    assert_eq!(inputs[0].frame_size, FRAME_SIZE);
    assert_eq!(ng.get_output_vstream_infos("").unwrap()[0].name, OUTPUT);

    assert_eq!(ng.get_default_streams_interface().unwrap(), StreamInterface::Pcie);
    assert!(!ng.is_multi_context().unwrap());
    assert_eq!(ng.get_config_params().unwrap(), loopback.core_op.get_config_params());
    assert!(matches!(
        ng.get_latency_measurement("net"),
        Err(AccelError::NotAvailable(_))
    ));

    assert!(!ng.is_scheduled().unwrap());
    assert!(matches!(
        ng.set_scheduler_threshold(4, ""),
        Err(AccelError::InvalidOperation(_))
    ));
    loopback.core_op.attach_scheduler(SchedulerParams::default());
    assert!(ng.is_scheduled().unwrap());
    ng.set_scheduler_threshold(4, "").unwrap();
    ng.set_scheduler_priority(31, "").unwrap();
    ng.set_scheduler_timeout(Duration::from_millis(250), "").unwrap();
    let scheduler = loopback.core_op.scheduler_params().unwrap();
    assert_eq!(scheduler.threshold, 4);
    assert_eq!(scheduler.priority, 31);
    assert_eq!(scheduler.timeout, Duration::from_millis(250));
    assert!(matches!(
        ng.set_scheduler_priority(1, "net"),
        Err(AccelError::InvalidOperation(_))
    ));
}

#[test]
fn test_data_plane_is_unavailable_through_proxy() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(1, loopback.core_op.clone(), std::process::id());
    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();

    assert!(matches!(
        ng.activate(DEFAULT_BATCH_SIZE),
        Err(AccelError::InvalidOperation(_))
    ));
    assert!(matches!(
        ng.get_input_streams(),
        Err(AccelError::InvalidOperation(_))
    ));
    assert!(matches!(
        ng.get_activation_time_accumulator(),
        Err(AccelError::InvalidOperation(_))
    ));
}

#[test]
fn test_duplicate_survives_release_of_original() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(3, loopback.core_op.clone(), std::process::id());
    let handle = identifier.network_group_handle;

    let original = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();
    let duplicate =
        NetworkGroupClient::duplicate_at(&service.addr(), handle, 3, original.name()).unwrap();
    assert_eq!(service.state.network_group_references(handle), 2);

    let shared = original.clone();
    drop(original);
    assert_eq!(service.state.network_group_references(handle), 2);
    drop(shared);
    assert_eq!(service.state.network_group_references(handle), 1);

    assert!(!duplicate.is_multi_context().unwrap());
    assert_eq!(duplicate.get_network_infos().unwrap().len(), 1);

    drop(duplicate);
    assert_eq!(service.state.network_group_references(handle), 0);
    assert!(matches!(
        service.state.network_group(&identifier),
        Err(AccelError::NotFound(_))
    ));
}

#[test]
fn test_frames_flow_through_proxy_vstreams() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(1, loopback.core_op.clone(), std::process::id());
    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();

    let inputs = ng.create_input_vstreams(&params(INPUT)).unwrap();
    let outputs = ng.create_output_vstreams(&params(OUTPUT)).unwrap();
    assert_eq!(inputs[0].name(), INPUT);
    assert_eq!(outputs[0].network_name(), "net");
    assert_eq!(outputs[0].get_frame_size(), FRAME_SIZE);
    assert_eq!(service.state.vstream_count(), 2);

    let _active = loopback.core_op.activate_with_guard(DEFAULT_BATCH_SIZE).unwrap();
    inputs[0].write(&[9, 8, 7, 6]).unwrap();
    let mut frame = [0u8; FRAME_SIZE];
    outputs[0].read(&mut frame).unwrap();
    assert_eq!(frame, [9, 8, 7, 6]);

    outputs[0].abort().unwrap();
    assert!(outputs[0].is_aborted().unwrap());
    assert!(outputs[0].read(&mut frame).unwrap_err().is_aborted_by_user());
    outputs[0].resume().unwrap();
    assert!(!outputs[0].is_aborted().unwrap());

    let second = inputs[0].duplicate().unwrap();
    assert_eq!(second.identifier(), inputs[0].identifier());
    drop(second);
    drop(inputs);
    drop(outputs);
    assert_eq!(service.state.vstream_count(), 0);
}

#[test]
fn test_read_of_wrong_size_is_rejected_before_transfer() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(1, loopback.core_op.clone(), std::process::id());
    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();
    let outputs = ng.create_output_vstreams(&params(OUTPUT)).unwrap();

    // The core-op is never activated, so a read that reached the vstream would time out.
    let rpc = RpcClient::connect(&service.addr()).unwrap();
    let mut oversized = vec![0u8; FRAME_SIZE + 1];
    assert!(matches!(
        rpc.output_vstream_read(outputs[0].identifier(), &mut oversized),
        Err(AccelError::InvalidArgument(_))
    ));
    let mut empty = [0u8; 0];
    assert!(matches!(
        rpc.output_vstream_read(outputs[0].identifier(), &mut empty),
        Err(AccelError::InvalidArgument(_))
    ));
}

#[test]
fn test_drop_inside_async_runtime_releases_handles() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(2, loopback.core_op.clone(), std::process::id());
    let handle = identifier.network_group_handle;
    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();
    let inputs = ng.create_input_vstreams(&params(INPUT)).unwrap();
    let outputs = ng.create_output_vstreams(&params(OUTPUT)).unwrap();
    assert_eq!(service.state.vstream_count(), 2);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        drop(inputs);
        drop(outputs);
        drop(ng);
    });

    assert_eq!(service.state.vstream_count(), 0);
    assert_eq!(service.state.network_group_references(handle), 0);
}

#[test]
fn test_reaper_aborts_silent_client_once() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let me = std::process::id();
    let identifier = service
        .state
        .register_network_group(1, loopback.core_op.clone(), me);

    let silent = me.wrapping_add(1000);
    let chatty = me.wrapping_add(2000);
    let rpc = RpcClient::connect(&service.addr()).unwrap();

    let input = rpc.input_vstreams_create(identifier, silent, &params(INPUT)).unwrap()[0];
    let input_id = VStreamIdentifier {
        vstream_handle: input,
        network_group_handle: identifier.network_group_handle,
        vdevice_handle: identifier.vdevice_handle,
    };
    // Two references from the silent pid must still abort only once.
    rpc.input_vstream_dup_handle(input_id, silent).unwrap();

    let output = rpc.output_vstreams_create(identifier, silent, &params(OUTPUT)).unwrap()[0];
    let output_id = VStreamIdentifier {
        vstream_handle: output,
        ..input_id
    };
    rpc.output_vstream_dup_handle(output_id, chatty).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    rpc.keep_alive(chatty).unwrap();
    service.state.update_client_timestamp(me);

    let reaped = service
        .state
        .remove_disconnected_clients(Duration::from_millis(100));
    assert_eq!(reaped, vec![silent]);
    assert!(service.state.is_client_alive(chatty));
    assert_eq!(loopback.input_channel.aborts(), 1);
    assert_eq!(loopback.output_channel.aborts(), 1);

    // The input vstream had no other holder; the output one is still held.
    assert!(matches!(
        rpc.input_vstream_is_aborted(input_id),
        Err(AccelError::NotFound(_))
    ));
    assert!(rpc.output_vstream_is_aborted(output_id).unwrap());

    assert!(
        service
            .state
            .remove_disconnected_clients(Duration::from_millis(100))
            .is_empty()
    );
    assert_eq!(loopback.input_channel.aborts(), 1);
    rpc.output_vstream_release(output_id, chatty).unwrap();
}

#[test]
fn test_keep_alive_thread_holds_off_reaper() {
    let service = TestService::start();
    let pid = std::process::id().wrapping_add(3000);
    let reaper = {
        let _guard = service.runtime.enter();
        accelrt_service::spawn_reaper(
            service.state.clone(),
            Duration::from_millis(20),
            Duration::from_millis(300),
        )
    };

    let keep_alive = KeepAliveThread::start(&service.addr(), pid, Duration::from_millis(30)).unwrap();
    std::thread::sleep(Duration::from_millis(600));
    assert!(service.state.is_client_alive(pid));

    drop(keep_alive);
    std::thread::sleep(Duration::from_millis(800));
    assert!(!service.state.is_client_alive(pid));
    reaper.abort();
}

#[test]
fn test_fork_hooks_reconnect_and_reregister() {
    let service = TestService::start();
    let loopback = loopback_core_op();
    let identifier =
        service
            .state
            .register_network_group(1, loopback.core_op.clone(), std::process::id());
    let handle = identifier.network_group_handle;
    let ng = NetworkGroupClient::create_at(&service.addr(), identifier).unwrap();

    ng.before_fork();
    assert!(matches!(
        ng.is_multi_context(),
        Err(AccelError::InvalidOperation(_))
    ));
    ng.after_fork_in_parent().unwrap();
    assert!(!ng.is_multi_context().unwrap());
    assert_eq!(service.state.network_group_references(handle), 1);

    ng.before_fork();
    ng.after_fork_in_child().unwrap();
    assert_eq!(ng.pid(), std::process::id());
    assert_eq!(service.state.network_group_references(handle), 2);

    drop(ng);
    assert_eq!(service.state.network_group_references(handle), 1);
}

#[test]
fn test_service_version() {
    let service = TestService::start();
    let rpc = RpcClient::connect(&service.addr()).unwrap();
    let (version, protocol) = rpc.get_service_version().unwrap();
    assert_eq!(version, accelrt_service::VERSION);
    assert_eq!(protocol, accelrt_service::PROTOCOL_VERSION);
}
