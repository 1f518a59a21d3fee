// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Frame assembly for detection (NMS) outputs.
//!
//! The device emits detections bbox by bbox: for every class a run of boxes
//! closed by a delimiter box. In burst mode boxes arrive in fixed-size
//! bursts, topped up with padding boxes. Callers only ever see assembled
//! frames:
//!
//! ```text
//! per class: [count: u16 LE][bbox 0]..[bbox count-1][zeros up to max_bboxes_per_class]
//! ```

use std::time::Duration;

use parking_lot::Mutex;

use super::{OutputStream, OutputStreamPtr, StreamBase, StreamBufferMode};
use crate::config::StreamInterface;
use crate::error::{AccelError, Result};
use crate::metadata::{LayerInfo, NmsInfo};
use crate::vdma::buffer::DmaAbleBufferPtr;

/// Marks the end of one class's boxes.
pub const NMS_DELIMITER: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Filler box completing a partial burst.
pub const NMS_DUMMY_BBOX: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const MARKER_SIZE: usize = std::mem::size_of::<u64>();

fn marker(bbox: &[u8]) -> u64 {
    let mut raw = [0u8; MARKER_SIZE];
    raw.copy_from_slice(&bbox[..MARKER_SIZE]);
    u64::from_le_bytes(raw)
}

/// Pulls bboxes out of the raw stream one transfer unit at a time.
struct BboxReader<'a> {
    base: &'a dyn OutputStream,
    unit: Vec<u8>,
    position: usize,
    bbox_size: usize,
    burst: bool,
}

impl<'a> BboxReader<'a> {
    fn new(base: &'a dyn OutputStream, nms_info: &NmsInfo) -> Self {
        let unit = vec![0u8; nms_info.transfer_size()];
        Self {
            base,
            position: unit.len(),
            unit,
            bbox_size: nms_info.bbox_size as usize,
            burst: nms_info.is_burst(),
        }
    }

    /// Offset of the next meaningful bbox in the current unit.
    fn next_bbox(&mut self) -> Result<usize> {
        loop {
            if self.position + self.bbox_size > self.unit.len() {
                self.base.read(&mut self.unit)?;
                self.position = 0;
            }
            let start = self.position;
            self.position += self.bbox_size;
            if self.burst && marker(&self.unit[start..]) == NMS_DUMMY_BBOX {
                continue;
            }
            return Ok(start);
        }
    }

    fn bbox(&self, start: usize) -> &[u8] {
        &self.unit[start..start + self.bbox_size]
    }
}

/// Decorator turning a raw detection output into whole-frame reads.
pub struct NmsOutputStream {
    base: OutputStreamPtr,
    nms_info: NmsInfo,
    queue_size: usize,
    buffer_mode: Mutex<Option<StreamBufferMode>>,
    read_lock: Mutex<()>,
}

impl NmsOutputStream {
    /// Takes over `base`, which from now on is only read through this decorator.
    pub fn new(base: OutputStreamPtr, queue_size: usize) -> Result<Self> {
        let layer = base.layer_info();
        let nms_info = layer.nms_info.ok_or_else(|| {
            AccelError::InvalidArgument(format!("layer '{}' has no NMS info", layer.name))
        })?;
        if (nms_info.bbox_size as usize) < MARKER_SIZE {
            return Err(AccelError::InvalidArgument(format!(
                "layer '{}' has {} byte bboxes, at least {} required",
                layer.name, nms_info.bbox_size, MARKER_SIZE
            )));
        }
        base.set_buffer_mode(StreamBufferMode::Owning)?;
        Ok(Self {
            base,
            nms_info,
            queue_size,
            buffer_mode: Mutex::new(None),
            read_lock: Mutex::new(()),
        })
    }

    pub fn nms_info(&self) -> &NmsInfo {
        &self.nms_info
    }

    fn assemble_frame(&self, frame: &mut [u8]) -> Result<()> {
        let frame_size = self.nms_info.frame_size();
        if frame.len() != frame_size {
            return Err(AccelError::InvalidArgument(format!(
                "NMS stream '{}' reads {} byte frames, got {} bytes",
                self.name(),
                frame_size,
                frame.len()
            )));
        }

        let _reading = self.read_lock.lock();
        let bbox_size = self.nms_info.bbox_size as usize;
        let max_bboxes = self.nms_info.max_bboxes_per_class as usize;
        let mut reader = BboxReader::new(self.base.as_ref(), &self.nms_info);
        let mut offset = 0;

        for class_index in 0..self.nms_info.total_classes() {
            let boxes_start = offset + std::mem::size_of::<u16>();
            let mut count = 0usize;
            loop {
                let start = reader.next_bbox()?;
                let bbox = reader.bbox(start);
                if marker(bbox) == NMS_DELIMITER {
                    break;
                }
                if count == max_bboxes {
                    return Err(AccelError::InternalFailure(format!(
                        "NMS stream '{}': class {} exceeds {} bboxes",
                        self.name(),
                        class_index,
                        max_bboxes
                    )));
                }
                let at = boxes_start + count * bbox_size;
                frame[at..at + bbox_size].copy_from_slice(bbox);
                count += 1;
            }
            frame[offset..boxes_start].copy_from_slice(&(count as u16).to_le_bytes());
            let class_end = boxes_start + max_bboxes * bbox_size;
            frame[boxes_start + count * bbox_size..class_end].fill(0);
            offset = class_end;
        }
        Ok(())
    }

    fn require_buffer_mode(&self, expected: StreamBufferMode) -> Result<()> {
        match *self.buffer_mode.lock() {
            Some(mode) if mode == expected => Ok(()),
            mode => Err(AccelError::InvalidOperation(format!(
                "stream '{}' is in {:?} buffer mode, operation requires {:?}",
                self.name(),
                mode,
                expected
            ))),
        }
    }
}

impl StreamBase for NmsOutputStream {
    fn layer_info(&self) -> &LayerInfo {
        self.base.layer_info()
    }

    fn interface(&self) -> StreamInterface {
        self.base.interface()
    }

    fn get_frame_size(&self) -> usize {
        self.nms_info.frame_size()
    }

    fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.base.activate_stream(dynamic_batch_size)
    }

    fn deactivate_stream(&self) -> Result<()> {
        self.base.deactivate_stream()
    }

    fn is_active(&self) -> bool {
        self.base.is_active()
    }

    fn abort(&self) -> Result<()> {
        self.base.abort()
    }

    fn clear_abort(&self) -> Result<()> {
        self.base.clear_abort()
    }

    fn is_aborted(&self) -> bool {
        self.base.is_aborted()
    }

    fn set_buffer_mode(&self, mode: StreamBufferMode) -> Result<()> {
        let mut current = self.buffer_mode.lock();
        match *current {
            Some(existing) if existing != mode => Err(AccelError::InvalidOperation(format!(
                "stream '{}' already uses {:?} buffer mode",
                self.name(),
                existing
            ))),
            _ => {
                *current = Some(mode);
                Ok(())
            }
        }
    }

    fn buffer_mode(&self) -> Option<StreamBufferMode> {
        *self.buffer_mode.lock()
    }

    fn set_timeout(&self, timeout: Duration) {
        self.base.set_timeout(timeout)
    }

    fn get_timeout(&self) -> Duration {
        self.base.get_timeout()
    }

    fn get_buffer_frames_size(&self) -> Result<usize> {
        Ok(self.queue_size)
    }
}

impl OutputStream for NmsOutputStream {
    fn read(&self, buffer: &mut [u8]) -> Result<()> {
        self.require_buffer_mode(StreamBufferMode::Owning)?;
        self.assemble_frame(buffer)
    }

    fn read_async(&self, buffer: DmaAbleBufferPtr) -> Result<()> {
        self.require_buffer_mode(StreamBufferMode::NotOwning)?;
        let mut frame = vec![0u8; self.get_frame_size()];
        if buffer.size() < frame.len() {
            return Err(AccelError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than frame size {}",
                buffer.size(),
                frame.len()
            )));
        }
        self.assemble_frame(&mut frame)?;
        buffer.copy_from(&frame)
    }
}
