// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder-facing types shared between the engine and its callers.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::device::BufferBacking;
use crate::device::DeviceError;
use crate::device::ServiceNotifier;
use crate::Rect;
use crate::Resolution;

pub mod stateful;

/// Completion status of a decode or drain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// The request was cancelled by a flush before completing.
    Aborted,
    Error,
}

/// A single-fire completion callback.
///
/// Firing consumes the callback, so a given request can never complete
/// twice. Dropping an unfired callback is an engine bug and is logged.
pub struct DecodeCb(Option<Box<dyn FnOnce(DecodeStatus) + Send>>);

impl DecodeCb {
    pub fn new(cb: impl FnOnce(DecodeStatus) + Send + 'static) -> Self {
        Self(Some(Box::new(cb)))
    }

    pub fn fire(mut self, status: DecodeStatus) {
        // The Option is only ever vacated here; Drop sees None afterward.
        if let Some(cb) = self.0.take() {
            cb(status);
        }
    }
}

impl Drop for DecodeCb {
    fn drop(&mut self) {
        if self.0.is_some() {
            log::error!("completion callback dropped without firing");
        }
    }
}

impl fmt::Debug for DecodeCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DecodeCb").field(&self.0.is_some()).finish()
    }
}

/// One compressed access unit submitted for decoding.
pub struct BitstreamBuffer<I: BufferBacking> {
    /// Caller-assigned identifier echoed back on the decoded frame.
    pub bitstream_id: i32,
    pub handle: I,
    pub offset: usize,
    pub size: usize,
}

/// Output stream geometry advertised to the picture-buffer producer
/// after a resolution change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub coded_size: Resolution,
    pub visible_rect: Rect,
    /// Number of buffers the producer should provision.
    pub num_buffers: usize,
}

/// A decoded picture emitted by the engine.
pub struct DecodedFrame<F> {
    pub frame: F,
    pub bitstream_id: i32,
    pub visible_rect: Rect,
}

/// Messages posted to the engine thread by the auxiliary threads.
pub enum EngineEvent<F> {
    /// The device poller woke up; queues need servicing.
    ServiceDevice { has_event: bool },
    /// A frame-pool fetch finished. `epoch` identifies the pool the
    /// fetch was issued against; stale epochs are ignored. `None` means
    /// the pool failed terminally.
    FrameReady { epoch: u64, result: Option<(F, u64)> },
    PollError(DeviceError),
}

/// Posts [`EngineEvent`]s to the engine thread and wakes it.
///
/// Cloned into the device poller and the frame-pool fetch thread. The
/// engine drains the paired receiver whenever the wake fd fires.
pub struct EngineNotifier<F> {
    sender: mpsc::Sender<EngineEvent<F>>,
    wake: Arc<EventFd>,
}

impl<F> EngineNotifier<F> {
    /// Creates a notifier plus the receiving end the engine drains.
    pub fn channel() -> Result<(Self, mpsc::Receiver<EngineEvent<F>>), nix::Error> {
        let (sender, receiver) = mpsc::channel();
        let wake = Arc::new(EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)?);
        Ok((Self { sender, wake }, receiver))
    }

    pub fn post(&self, event: EngineEvent<F>) {
        // A send failure means the engine is gone; the wake-up is moot.
        if self.sender.send(event).is_ok() {
            if let Err(err) = self.wake.write(1) {
                log::error!("failed to wake engine thread: {}", err);
            }
        }
    }

    /// The fd the engine's owner polls to learn that events are pending.
    pub fn wake_fd(&self) -> Arc<EventFd> {
        self.wake.clone()
    }
}

impl<F> Clone for EngineNotifier<F> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), wake: self.wake.clone() }
    }
}

impl<F: Send + 'static> ServiceNotifier for EngineNotifier<F> {
    fn notify_service_needed(&self, has_event: bool) {
        self.post(EngineEvent::ServiceDevice { has_event });
    }

    fn notify_poll_error(&self, error: DeviceError) {
        self.post(EngineEvent::PollError(error));
    }
}
