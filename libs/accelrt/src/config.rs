// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configure-time parameters for a core-op and its streams.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{AccelError, Result};
use crate::metadata::StreamDirection;

/// Sentinel batch size: "let the scheduler decide". Never a real batch value.
pub const DEFAULT_BATCH_SIZE: u16 = 0;

/// Batch size used whenever the sentinel is in effect.
pub const DEFAULT_ACTUAL_BATCH_SIZE: u16 = 1;

/// Multiplier applied to the batch size when sizing transfer queues.
pub const MAX_ACTIVE_TRANSFERS_SCALE: usize = 2;

pub const DEFAULT_VSTREAM_TIMEOUT_MS: u64 = 10_000;

/// Transport a stream is carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamInterface {
    Pcie,
    Integrated,
    Eth,
    Mipi,
}

impl StreamInterface {
    /// Interfaces served by a DMA engine on the local bus.
    pub fn is_vdma(self) -> bool {
        matches!(self, Self::Pcie | Self::Integrated)
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Pcie => 0,
            Self::Integrated => 1,
            Self::Eth => 2,
            Self::Mipi => 3,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Pcie),
            1 => Some(Self::Integrated),
            2 => Some(Self::Eth),
            3 => Some(Self::Mipi),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct StreamFlags: u32 {
        /// Caller supplies transfer buffers per call.
        const ASYNC = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct LatencyMeasurementFlags: u32 {
        const MEASURE = 1 << 0;
        const CLEAR_AFTER_GET = 1 << 1;
    }
}

macro_rules! impl_raw_flags {
    ($flags:ty) => {
        impl From<u32> for $flags {
            fn from(raw: u32) -> Self {
                Self::from_bits_truncate(raw)
            }
        }

        impl From<$flags> for u32 {
            fn from(flags: $flags) -> Self {
                flags.bits()
            }
        }
    };
}

impl_raw_flags!(StreamFlags);
impl_raw_flags!(LatencyMeasurementFlags);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Performance,
    UltraPerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthInputStreamParams {
    pub host_address: SocketAddr,
    pub device_address: SocketAddr,
    pub max_payload_size: u16,
    pub rate_limit_bytes_per_sec: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthOutputStreamParams {
    pub host_address: SocketAddr,
    pub device_address: SocketAddr,
    pub max_payload_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipiInputStreamParams {
    pub data_type: u8,
    pub pixels_per_clock: u8,
    pub number_of_lanes: u8,
    pub clock_selection_mhz: u32,
    pub virtual_channel_index: u8,
}

/// Transport-specific sub-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportParams {
    #[default]
    Vdma,
    EthInput(EthInputStreamParams),
    EthOutput(EthOutputStreamParams),
    MipiInput(MipiInputStreamParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParameters {
    pub interface: StreamInterface,
    pub direction: StreamDirection,
    #[serde(default)]
    pub flags: StreamFlags,
    #[serde(default)]
    pub transport: TransportParams,
}

impl StreamParameters {
    pub fn vdma(interface: StreamInterface, direction: StreamDirection) -> Self {
        Self {
            interface,
            direction,
            flags: StreamFlags::empty(),
            transport: TransportParams::Vdma,
        }
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(StreamFlags::ASYNC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub batch_size: u16,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Parameters a core-op is configured with.
///
/// Stream names are the map keys, so a name can only be given once per
/// configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigureNetworkParams {
    #[serde(default)]
    pub batch_size: u16,
    #[serde(default)]
    pub power_mode: PowerMode,
    #[serde(default)]
    pub latency: LatencyMeasurementFlags,
    #[serde(default)]
    pub stream_params_by_name: BTreeMap<String, StreamParameters>,
    #[serde(default)]
    pub network_params_by_name: BTreeMap<String, NetworkParams>,
}

impl ConfigureNetworkParams {
    /// Smallest explicitly configured batch size across all networks.
    ///
    /// Networks left at [`DEFAULT_BATCH_SIZE`] are ignored; if every network
    /// uses the sentinel the result is [`DEFAULT_ACTUAL_BATCH_SIZE`].
    pub fn smallest_configured_batch_size(&self) -> u16 {
        self.network_params_by_name
            .values()
            .map(|params| params.batch_size)
            .filter(|&batch_size| batch_size != DEFAULT_BATCH_SIZE)
            .min()
            .unwrap_or(DEFAULT_ACTUAL_BATCH_SIZE)
    }

    pub fn is_default_batch_size(&self) -> bool {
        self.network_params_by_name
            .values()
            .all(|params| params.batch_size == DEFAULT_BATCH_SIZE)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AccelError::InvalidArgument(format!("Invalid configure params: {}", e)))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            AccelError::InternalFailure(format!("Failed to serialize configure params: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_batches(batches: &[(&str, u16)]) -> ConfigureNetworkParams {
        ConfigureNetworkParams {
            network_params_by_name: batches
                .iter()
                .map(|(name, batch_size)| {
                    (
                        name.to_string(),
                        NetworkParams {
                            batch_size: *batch_size,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_all_default_batch_sizes_resolve_to_default_actual() {
        let params = with_batches(&[("a", DEFAULT_BATCH_SIZE), ("b", DEFAULT_BATCH_SIZE)]);
        assert_eq!(
            params.smallest_configured_batch_size(),
            DEFAULT_ACTUAL_BATCH_SIZE
        );
        assert!(params.is_default_batch_size());
    }

    #[test]
    fn test_sentinel_is_ignored_in_minimum() {
        let params = with_batches(&[("a", 8), ("b", DEFAULT_BATCH_SIZE), ("c", 4)]);
        assert_eq!(params.smallest_configured_batch_size(), 4);
        assert!(!params.is_default_batch_size());
    }

    #[test]
    fn test_no_networks_resolve_to_default_actual() {
        let params = ConfigureNetworkParams::default();
        assert_eq!(
            params.smallest_configured_batch_size(),
            DEFAULT_ACTUAL_BATCH_SIZE
        );
    }

    #[test]
    fn test_json_config() {
        let raw = r#"{
            "latency": 3,
            "stream_params_by_name": {
                "net/input0": { "interface": "pcie", "direction": "host_to_device", "flags": 1 },
                "net/output0": { "interface": "pcie", "direction": "device_to_host" }
            },
            "network_params_by_name": { "net": { "batch_size": 2 } }
        }"#;
        let params = ConfigureNetworkParams::from_json_str(raw).unwrap();
        assert!(params.latency.contains(LatencyMeasurementFlags::CLEAR_AFTER_GET));
        assert!(params.stream_params_by_name["net/input0"].is_async());
        assert!(!params.stream_params_by_name["net/output0"].is_async());
        assert_eq!(params.smallest_configured_batch_size(), 2);

        let again =
            ConfigureNetworkParams::from_json_str(&params.to_json_string().unwrap()).unwrap();
        assert_eq!(again, params);
    }

    #[test]
    fn test_invalid_json_is_invalid_argument() {
        let err = ConfigureNetworkParams::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));
    }
}
