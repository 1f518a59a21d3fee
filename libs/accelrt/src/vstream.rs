// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Named frame channels handed to applications.
//!
//! A vstream is a thin view over one raw stream: frames are passed through
//! unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_VSTREAM_TIMEOUT_MS;
use crate::error::Result;
use crate::metadata::StreamInfo;
use crate::stream::{InputStream, InputStreamPtr, OutputStream, OutputStreamPtr, StreamBase};

pub type VStreamInfo = StreamInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VStreamParams {
    pub timeout_ms: u32,
}

impl Default for VStreamParams {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_VSTREAM_TIMEOUT_MS as u32,
        }
    }
}

impl VStreamParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }
}

pub struct InputVStream {
    stream: InputStreamPtr,
}

impl InputVStream {
    pub fn new(stream: InputStreamPtr, params: &VStreamParams) -> Self {
        stream.set_timeout(params.timeout());
        Self { stream }
    }

    pub fn name(&self) -> &str {
        self.stream.name()
    }

    pub fn network_name(&self) -> &str {
        self.stream.network_name()
    }

    pub fn get_frame_size(&self) -> usize {
        self.stream.get_frame_size()
    }

    pub fn info(&self) -> VStreamInfo {
        self.stream.layer_info().stream_info()
    }

    pub fn write(&self, frame: &[u8]) -> Result<()> {
        self.stream.write(frame)
    }

    pub fn abort(&self) -> Result<()> {
        tracing::debug!(vstream = %self.name(), "Aborting input vstream");
        self.stream.abort()
    }

    pub fn resume(&self) -> Result<()> {
        self.stream.clear_abort()
    }

    pub fn is_aborted(&self) -> bool {
        self.stream.is_aborted()
    }
}

pub struct OutputVStream {
    stream: OutputStreamPtr,
}

impl OutputVStream {
    pub fn new(stream: OutputStreamPtr, params: &VStreamParams) -> Self {
        stream.set_timeout(params.timeout());
        Self { stream }
    }

    pub fn name(&self) -> &str {
        self.stream.name()
    }

    pub fn network_name(&self) -> &str {
        self.stream.network_name()
    }

    pub fn get_frame_size(&self) -> usize {
        self.stream.get_frame_size()
    }

    pub fn info(&self) -> VStreamInfo {
        self.stream.layer_info().stream_info()
    }

    pub fn read(&self, frame: &mut [u8]) -> Result<()> {
        self.stream.read(frame)
    }

    pub fn abort(&self) -> Result<()> {
        tracing::debug!(vstream = %self.name(), "Aborting output vstream");
        self.stream.abort()
    }

    pub fn resume(&self) -> Result<()> {
        self.stream.clear_abort()
    }

    pub fn is_aborted(&self) -> bool {
        self.stream.is_aborted()
    }
}
