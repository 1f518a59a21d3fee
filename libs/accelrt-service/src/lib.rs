// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! accelrt-service - lets several processes share core-ops configured on
//! one accelerator.
//!
//! The service process publishes configured core-ops through
//! [`ServiceState::register_network_group`] and serves them over gRPC.
//! Other processes drive them through [`NetworkGroupClient`] and the
//! vstream clients it creates. Clients send periodic keep-alives; the
//! service aborts and drops everything held by a client that goes quiet.

pub mod client;
pub mod config;
pub mod proto;
pub mod service;
pub mod state;

pub use client::{
    CALL_TIMEOUT, InputVStreamClient, KeepAliveThread, NetworkGroupClient, OutputVStreamClient,
    RpcClient, service_addr,
};
pub use config::{ConfigError, DEFAULT_SERVICE_ADDR, SERVICE_ADDR_ENV, ServiceArgs, ServiceConfig};
pub use proto::{NetworkGroupIdentifier, VStreamIdentifier};
pub use service::{
    CoreOpRpcService, HandleTable, PROTOCOL_VERSION, ServiceState, serve, serve_with_listener,
    spawn_reaper,
};

/// Service version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
