// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Static description of a compiled core-op: layers, streams and networks.
//!
//! Built once by the model-file parser and shared read-only afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AccelError, Result};

pub type CoreOpMetadataPtr = Arc<CoreOpMetadata>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    HostToDevice,
    DeviceToHost,
}

impl StreamDirection {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::HostToDevice => 0,
            Self::DeviceToHost => 1,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::HostToDevice),
            1 => Some(Self::DeviceToHost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatOrder {
    #[default]
    Auto,
    Nhwc,
    Nchw,
    Nc,
    Nv12,
    /// Detection output: per-class bounding boxes after non-max suppression.
    Nms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatType {
    #[default]
    Auto,
    Uint8,
    Uint16,
    Float32,
}

impl FormatType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::Auto | Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Format {
    pub order: FormatOrder,
    #[serde(rename = "type")]
    pub format_type: FormatType,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsBurstType {
    #[default]
    NoBurst,
    /// Boxes arrive in fixed-size bursts padded with filler boxes.
    Burst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NmsInfo {
    pub number_of_classes: u32,
    pub max_bboxes_per_class: u32,
    pub bbox_size: u32,
    pub chunks_per_frame: u32,
    #[serde(default)]
    pub burst_size: u32,
    #[serde(default)]
    pub burst_type: NmsBurstType,
}

impl NmsInfo {
    /// Classes emitted per frame across all chunks.
    pub fn total_classes(&self) -> usize {
        self.number_of_classes as usize * self.chunks_per_frame.max(1) as usize
    }

    /// Size of one assembled frame: per class a `u16` count plus the padded box area.
    pub fn frame_size(&self) -> usize {
        let per_class = std::mem::size_of::<u16>()
            + self.max_bboxes_per_class as usize * self.bbox_size as usize;
        self.total_classes() * per_class
    }

    pub fn is_burst(&self) -> bool {
        self.burst_type == NmsBurstType::Burst && self.burst_size > 0
    }

    /// Bytes the device emits per transfer: one bbox, or one burst of bboxes.
    pub fn transfer_size(&self) -> usize {
        if self.is_burst() {
            self.burst_size as usize * self.bbox_size as usize
        } else {
            self.bbox_size as usize
        }
    }
}

/// One tensor boundary of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub network_name: String,
    pub direction: StreamDirection,
    #[serde(default)]
    pub format: Format,
    /// Bytes per frame as laid out on the device.
    pub frame_size: usize,
    #[serde(default)]
    pub nms_info: Option<NmsInfo>,
    #[serde(default)]
    pub is_multi_planar: bool,
    #[serde(default)]
    pub planes: Vec<LayerInfo>,
}

impl LayerInfo {
    pub fn new(
        name: impl Into<String>,
        network_name: impl Into<String>,
        direction: StreamDirection,
        frame_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            network_name: network_name.into(),
            direction,
            format: Format::default(),
            frame_size,
            nms_info: None,
            is_multi_planar: false,
            planes: Vec::new(),
        }
    }

    pub fn with_nms(mut self, nms_info: NmsInfo) -> Self {
        self.format.order = FormatOrder::Nms;
        self.frame_size = nms_info.frame_size();
        self.nms_info = Some(nms_info);
        self
    }

    pub fn with_planes(mut self, planes: Vec<LayerInfo>) -> Self {
        self.is_multi_planar = !planes.is_empty();
        self.planes = planes;
        self
    }

    pub fn is_nms(&self) -> bool {
        self.format.order == FormatOrder::Nms
    }

    /// Bytes moved by one raw transfer: a whole frame, or for detection
    /// layers a single bbox or burst.
    pub fn transfer_size(&self) -> usize {
        match &self.nms_info {
            Some(nms) => nms.transfer_size(),
            None => self.frame_size,
        }
    }

    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            name: self.name.clone(),
            network_name: self.network_name.clone(),
            direction: self.direction,
            format: self.format,
            frame_size: self.frame_size,
            nms_info: self.nms_info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub network_name: String,
    pub direction: StreamDirection,
    pub format: Format,
    pub frame_size: usize,
    pub nms_info: Option<NmsInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportedFeatures {
    pub multi_context: bool,
    pub preliminary_run_asap: bool,
    pub multi_network_support: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreOpMetadata {
    core_op_name: String,
    layer_infos: Vec<LayerInfo>,
    network_names: Vec<String>,
    supported_features: SupportedFeatures,
}

impl CoreOpMetadata {
    /// Networks are collected from the layers in order of first appearance.
    pub fn new(
        core_op_name: impl Into<String>,
        layer_infos: Vec<LayerInfo>,
        supported_features: SupportedFeatures,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let network_names = layer_infos
            .iter()
            .filter(|layer| seen.insert(layer.network_name.clone()))
            .map(|layer| layer.network_name.clone())
            .collect();
        Self {
            core_op_name: core_op_name.into(),
            layer_infos,
            network_names,
            supported_features,
        }
    }

    pub fn core_op_name(&self) -> &str {
        &self.core_op_name
    }

    pub fn supported_features(&self) -> SupportedFeatures {
        self.supported_features
    }

    /// Top-level layers, followed by the planes of every multi-planar layer.
    pub fn get_all_layer_infos(&self) -> Vec<LayerInfo> {
        let mut all = self.layer_infos.clone();
        all.extend(
            self.layer_infos
                .iter()
                .flat_map(|layer| layer.planes.iter().cloned()),
        );
        all
    }

    pub fn get_layer_info(&self, stream_name: &str) -> Result<LayerInfo> {
        self.layer_infos
            .iter()
            .flat_map(|layer| std::iter::once(layer).chain(layer.planes.iter()))
            .find(|layer| layer.name == stream_name)
            .cloned()
            .ok_or_else(|| {
                AccelError::NotFound(format!(
                    "layer '{}' in core-op '{}'",
                    stream_name, self.core_op_name
                ))
            })
    }

    pub fn get_input_layer_infos(&self) -> Vec<LayerInfo> {
        self.layers_in_direction(StreamDirection::HostToDevice)
    }

    pub fn get_output_layer_infos(&self) -> Vec<LayerInfo> {
        self.layers_in_direction(StreamDirection::DeviceToHost)
    }

    fn layers_in_direction(&self, direction: StreamDirection) -> Vec<LayerInfo> {
        self.layer_infos
            .iter()
            .filter(|layer| layer.direction == direction)
            .cloned()
            .collect()
    }

    fn check_network(&self, network_name: &str) -> Result<()> {
        if network_name.is_empty() || self.network_names.iter().any(|n| n == network_name) {
            Ok(())
        } else {
            Err(AccelError::NotFound(format!(
                "network '{}' in core-op '{}'",
                network_name, self.core_op_name
            )))
        }
    }

    fn stream_infos(
        &self,
        network_name: &str,
        direction: Option<StreamDirection>,
    ) -> Result<Vec<StreamInfo>> {
        self.check_network(network_name)?;
        Ok(self
            .layer_infos
            .iter()
            .filter(|layer| network_name.is_empty() || layer.network_name == network_name)
            .filter(|layer| direction.is_none_or(|d| layer.direction == d))
            .map(LayerInfo::stream_info)
            .collect())
    }

    /// Empty `network_name` selects every network.
    pub fn get_input_stream_infos(&self, network_name: &str) -> Result<Vec<StreamInfo>> {
        self.stream_infos(network_name, Some(StreamDirection::HostToDevice))
    }

    pub fn get_output_stream_infos(&self, network_name: &str) -> Result<Vec<StreamInfo>> {
        self.stream_infos(network_name, Some(StreamDirection::DeviceToHost))
    }

    pub fn get_all_stream_infos(&self, network_name: &str) -> Result<Vec<StreamInfo>> {
        self.stream_infos(network_name, None)
    }

    pub fn get_network_infos(&self) -> Vec<NetworkInfo> {
        self.network_names
            .iter()
            .map(|name| NetworkInfo { name: name.clone() })
            .collect()
    }

    pub fn network_names(&self) -> &[String] {
        &self.network_names
    }
}
