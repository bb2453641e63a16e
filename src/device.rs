// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Abstraction over a stateful memory-to-memory decode device.
//!
//! The kernel exposes two buffer queues: an input queue taking compressed
//! access units and an output queue producing decoded pictures. The
//! [`StatefulDevice`] trait captures exactly the operations the decoder
//! engine needs so unit tests can drive the engine against a scripted
//! fake instead of real hardware.

use crate::{Fourcc, Rect, Resolution};

#[cfg(feature = "v4l2")]
pub mod poller;
#[cfg(feature = "v4l2")]
pub mod v4l2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    Input,
    Output,
}

/// Errors surfaced by device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("format {0} not supported by device")]
    UnsupportedFormat(Fourcc),
    #[error("{op} failed: {reason}")]
    Ioctl { op: &'static str, reason: String },
    #[error("no buffer allocated for slot {0}")]
    InvalidSlot(usize),
    #[error("polling thread error: {0}")]
    Poller(String),
}

impl DeviceError {
    pub fn ioctl(op: &'static str, reason: impl ToString) -> Self {
        DeviceError::Ioctl { op, reason: reason.to_string() }
    }
}

/// Memory backing a compressed input buffer.
///
/// `id` must be stable for the lifetime of the backing memory so the
/// engine can recognize a recurring buffer and reuse the device slot it
/// was previously imported into.
pub trait BufferBacking {
    /// The raw payload, or `None` when the memory is not CPU-readable
    /// (protected content).
    fn bytes(&self) -> Option<&[u8]>;
    fn id(&self) -> u64;
}

impl BufferBacking for Vec<u8> {
    fn bytes(&self) -> Option<&[u8]> {
        Some(self)
    }

    fn id(&self) -> u64 {
        self.as_ptr() as u64
    }
}

/// A completed input-queue buffer, returned to the engine for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedInput {
    pub slot: usize,
    /// The identifier the engine placed in the buffer's timestamp field
    /// when queuing.
    pub bitstream_id: i32,
}

/// A decoded output-queue buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedOutput {
    pub slot: usize,
    pub bitstream_id: i32,
    pub bytes_used: usize,
    /// Set on the final buffer of a drain sequence.
    pub is_last: bool,
}

/// Receives wake-ups from the device polling thread. One notification is
/// posted per poll wake, never per buffer.
pub trait ServiceNotifier: Send + 'static {
    /// `has_event` is set when an out-of-band device event (such as a
    /// source change) is pending in addition to any ready buffers.
    fn notify_service_needed(&self, has_event: bool);

    /// Reports a polling failure. The engine treats this as fatal.
    fn notify_poll_error(&self, error: DeviceError);
}

/// A stateful decode device with two memory-to-memory buffer queues.
///
/// All methods are called from the engine thread only. Buffer slots are
/// dense indices in `0..allocated count` per queue direction, reset
/// whenever that queue is reallocated.
pub trait StatefulDevice {
    /// Compressed input handle type queued on the input queue.
    type InputBuffer: BufferBacking + Send + 'static;
    /// Decoded picture memory queued on the output queue.
    type Frame: Send + 'static;

    fn supported_input_formats(&self) -> Result<Vec<Fourcc>, DeviceError>;
    fn supported_output_formats(&self) -> Result<Vec<Fourcc>, DeviceError>;

    /// Negotiates the compressed input format with `buffer_size` bytes
    /// per input buffer.
    fn set_input_format(&mut self, fourcc: Fourcc, buffer_size: usize) -> Result<(), DeviceError>;

    /// Negotiates the decoded output pixel format. The device picks the
    /// coded size itself based on the parsed stream.
    fn set_output_format(&mut self, fourcc: Fourcc) -> Result<(), DeviceError>;

    /// The currently negotiated output coded size and pixel format.
    fn output_format(&self) -> Result<(Resolution, Fourcc), DeviceError>;

    /// Minimum number of output buffers the decoder needs to make
    /// progress, as reported by the driver.
    fn min_output_buffers(&self) -> Result<usize, DeviceError>;

    /// The visible (crop) rectangle of decoded pictures. No containment
    /// validation is performed here; callers must sanity-check the
    /// result against the coded size.
    fn visible_rect(&self) -> Result<Rect, DeviceError>;

    /// Allocates `count` buffers on the given queue, returning the count
    /// actually granted. A count of zero deallocates.
    fn allocate_buffers(
        &mut self,
        direction: QueueDirection,
        count: usize,
    ) -> Result<usize, DeviceError>;

    fn stream_on(&mut self, direction: QueueDirection) -> Result<(), DeviceError>;
    fn stream_off(&mut self, direction: QueueDirection) -> Result<(), DeviceError>;

    /// Queues `size` bytes at `offset` of `buffer` into input `slot`,
    /// tagging the buffer with `bitstream_id`.
    fn queue_input(
        &mut self,
        slot: usize,
        bitstream_id: i32,
        buffer: &Self::InputBuffer,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError>;

    /// Dequeues a completed input buffer, or `None` if none is ready.
    fn dequeue_input(&mut self) -> Result<Option<DequeuedInput>, DeviceError>;

    fn queue_output(&mut self, slot: usize, frame: &Self::Frame) -> Result<(), DeviceError>;

    /// Dequeues a decoded output buffer, or `None` if none is ready.
    fn dequeue_output(&mut self) -> Result<Option<DequeuedOutput>, DeviceError>;

    fn subscribe_source_change(&mut self) -> Result<(), DeviceError>;

    /// Pops a pending source-change event. Returns `false` when no event
    /// is queued.
    fn dequeue_source_change(&mut self) -> Result<bool, DeviceError>;

    /// Whether the driver implements the stop/start decoder commands
    /// used for draining.
    fn supports_drain_commands(&self) -> Result<bool, DeviceError>;

    /// Tells the decoder to process everything queued so far and mark
    /// the final output buffer as last.
    fn send_stop_command(&mut self) -> Result<(), DeviceError>;

    /// Resumes decoding after a completed drain.
    fn send_start_command(&mut self) -> Result<(), DeviceError>;

    /// Starts the polling thread. Wake-ups are posted to `notifier`.
    fn start_polling(&mut self, notifier: Box<dyn ServiceNotifier>) -> Result<(), DeviceError>;

    /// Stops the polling thread, joining it.
    fn stop_polling(&mut self) -> Result<(), DeviceError>;

    /// Allocates a throwaway frame of `size` bytes used to prime the
    /// output queue before the stream's real dimensions are known.
    fn allocate_placeholder_frame(&mut self, size: usize) -> Result<Self::Frame, DeviceError>;
}
