// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful decode engine.
//!
//! Owns the device's two buffer queues and drives format negotiation,
//! dynamic resolution change, drain and flush sequencing against them.
//! All state lives on a single thread; the device poller and the frame
//! pool's fetch thread only post [`EngineEvent`]s back through the
//! engine's channel, which the owner drains via
//! [`StatefulDecoder::process_pending_events`] whenever the wake fd
//! fires.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use nix::sys::eventfd::EventFd;

use crate::bitstream;
use crate::decoder::BitstreamBuffer;
use crate::decoder::DecodeCb;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedFrame;
use crate::decoder::EngineEvent;
use crate::decoder::EngineNotifier;
use crate::device::BufferBacking;
use crate::device::DeviceError;
use crate::device::QueueDirection;
use crate::device::StatefulDevice;
use crate::frame_pool::FramePool;
use crate::resolution_contains_rect;
use crate::Fourcc;
use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

const NUM_INPUT_BUFFERS: usize = 16;
// Margin over the driver minimum so buffers can sit downstream in the
// display pipeline without starving the decoder.
const NUM_EXTRA_OUTPUT_BUFFERS: usize = 4;

const SUPPORTED_OUTPUT_FOURCCS: [Fourcc; 8] = [
    Fourcc::from_bytes(b"YU12"),
    Fourcc::from_bytes(b"YV12"),
    Fourcc::from_bytes(b"YM12"),
    Fourcc::from_bytes(b"YM21"),
    Fourcc::from_bytes(b"NV12"),
    Fourcc::from_bytes(b"NV21"),
    Fourcc::from_bytes(b"NM12"),
    Fourcc::from_bytes(b"NM21"),
];

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("driver does not implement the stop/start decoder commands")]
    DrainUnsupported,
    #[error("device supports none of the known output formats")]
    NoOutputFormat,
    #[error("driver reported an empty coded size")]
    EmptyCodedSize,
    #[error("failed to allocate {0} buffers")]
    Allocation(&'static str),
    #[error("failed to acquire a frame pool for {0}")]
    PoolCreation(Resolution),
    #[error("buffer accounting failure: {0}")]
    Accounting(&'static str),
}

/// Parameters for creating a picture-buffer pool after a resolution
/// change.
pub struct PoolSpec<F> {
    pub coded_size: Resolution,
    pub visible_rect: Rect,
    /// Number of buffers the pool should provision; matches the output
    /// queue allocation.
    pub num_buffers: usize,
    /// Epoch to tag fetch results with.
    pub epoch: u64,
    pub notifier: EngineNotifier<F>,
}

pub type GetPoolCb<F> = Box<dyn FnMut(PoolSpec<F>) -> Option<Box<dyn FramePool<F>>> + Send>;
pub type OutputCb<F> = Box<dyn FnMut(DecodedFrame<F>) + Send>;
pub type ErrorCb = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decoding,
    Draining,
    Error,
}

/// Fixed pool of input queue slots.
///
/// Each slot remembers the identity of the last backing memory imported
/// into it so a recurring buffer can skip re-import by going back to the
/// same slot.
struct InputSlots {
    backing_ids: Vec<Option<u64>>,
    queued: Vec<bool>,
    /// Slots below this index have been handed out at least once.
    next_unused: usize,
}

impl InputSlots {
    fn new(count: usize) -> Self {
        Self { backing_ids: vec![None; count], queued: vec![false; count], next_unused: 0 }
    }

    fn queued_count(&self) -> usize {
        self.queued.iter().filter(|&&q| q).count()
    }

    /// Picks a slot for `backing_id` and marks it queued. Preference
    /// order: the slot this backing was last imported into, then a
    /// never-used slot, then any free slot. `None` when every slot holds
    /// unconsumed data.
    fn claim(&mut self, backing_id: u64) -> Option<usize> {
        let matched = (0..self.next_unused).find(|&i| self.backing_ids[i] == Some(backing_id));
        let preferred = match matched {
            Some(slot) => Some(slot),
            None if self.next_unused < self.backing_ids.len() => {
                self.next_unused += 1;
                Some(self.next_unused - 1)
            }
            None => None,
        };
        let slot = preferred
            .filter(|&slot| !self.queued[slot])
            .or_else(|| (0..self.backing_ids.len()).find(|&slot| !self.queued[slot]))?;
        self.backing_ids[slot] = Some(backing_id);
        self.queued[slot] = true;
        Some(slot)
    }

    fn release(&mut self, slot: usize) {
        if let Some(queued) = self.queued.get_mut(slot) {
            *queued = false;
        }
    }

    fn release_all(&mut self) {
        self.queued.iter_mut().for_each(|queued| *queued = false);
    }
}

/// Bidirectional binding between pool block ids and output queue slots.
///
/// A binding is stable for the lifetime of the current resolution epoch;
/// the whole map is cleared when the output queue is reallocated.
#[derive(Default)]
struct OutputSlotMap {
    bindings: BTreeMap<u64, usize>,
}

impl OutputSlotMap {
    fn slot_for_block(&self, block_id: u64) -> Option<usize> {
        self.bindings.get(&block_id).copied()
    }

    fn block_for_slot(&self, slot: usize) -> Option<u64> {
        self.bindings.iter().find(|(_, &s)| s == slot).map(|(&block_id, _)| block_id)
    }

    /// Binds `block_id` to the next unbound slot. Slots are assigned
    /// densely from zero.
    fn bind_next(&mut self, block_id: u64) -> usize {
        let slot = self.bindings.len();
        self.bindings.insert(block_id, slot);
        slot
    }

    fn len(&self) -> usize {
        self.bindings.len()
    }

    fn clear(&mut self) {
        self.bindings.clear();
    }
}

struct DecodeRequest<I: BufferBacking> {
    /// `None` marks a drain request.
    buffer: Option<BitstreamBuffer<I>>,
    cb: DecodeCb,
}

pub struct StatefulDecoder<D: StatefulDevice> {
    device: D,
    codec: VideoCodec,
    is_secure: bool,
    state: State,
    min_num_output_buffers: usize,

    decode_requests: VecDeque<DecodeRequest<D::InputBuffer>>,
    pending_decode_cbs: BTreeMap<i32, DecodeCb>,
    drain_cb: Option<DecodeCb>,
    input_slots: InputSlots,

    num_output_slots: usize,
    output_streaming: bool,
    frame_at_device: BTreeMap<usize, D::Frame>,
    slot_map: OutputSlotMap,
    /// Frames rescued from the device on flush, requeued ahead of any
    /// pool fetch.
    reuse_frame_queue: VecDeque<(u64, D::Frame)>,
    /// A throwaway frame is on the output queue instead of real picture
    /// buffers; cleared by the first resolution change.
    placeholder_active: bool,
    /// An IDR or keyframe was submitted, so the device will raise a
    /// resolution change before producing output.
    seen_sync_point: bool,

    frame_pool: Option<Box<dyn FramePool<D::Frame>>>,
    pool_epoch: u64,
    fetch_in_flight: bool,

    coded_size: Resolution,
    visible_rect: Rect,

    notifier: EngineNotifier<D::Frame>,
    events: mpsc::Receiver<EngineEvent<D::Frame>>,
    get_pool_cb: GetPoolCb<D::Frame>,
    output_cb: OutputCb<D::Frame>,
    error_cb: ErrorCb,
}

impl<D: StatefulDevice> StatefulDecoder<D> {
    /// Opens the decode path on `device`: negotiates the input format for
    /// `codec`, allocates and streams the input queue, primes the output
    /// queue with a placeholder frame and starts polling.
    pub fn new(
        mut device: D,
        codec: VideoCodec,
        input_buffer_size: usize,
        min_num_output_buffers: usize,
        is_secure: bool,
        get_pool_cb: GetPoolCb<D::Frame>,
        output_cb: OutputCb<D::Frame>,
        error_cb: ErrorCb,
    ) -> Result<Self, DecoderError> {
        if !device.supports_drain_commands()? {
            return Err(DecoderError::DrainUnsupported);
        }
        device.subscribe_source_change()?;

        let input_fourcc = codec.fourcc();
        if !device.supported_input_formats()?.contains(&input_fourcc) {
            return Err(DeviceError::UnsupportedFormat(input_fourcc).into());
        }
        device.set_input_format(input_fourcc, input_buffer_size)?;
        let num_input_slots = device.allocate_buffers(QueueDirection::Input, NUM_INPUT_BUFFERS)?;
        if num_input_slots == 0 {
            return Err(DecoderError::Allocation("input"));
        }
        device.stream_on(QueueDirection::Input)?;

        let (notifier, events) =
            EngineNotifier::channel().map_err(|err| DeviceError::ioctl("eventfd", err))?;

        let mut decoder = Self {
            device,
            codec,
            is_secure,
            state: State::Idle,
            min_num_output_buffers,
            decode_requests: VecDeque::new(),
            pending_decode_cbs: BTreeMap::new(),
            drain_cb: None,
            input_slots: InputSlots::new(num_input_slots),
            num_output_slots: 0,
            output_streaming: false,
            frame_at_device: BTreeMap::new(),
            slot_map: OutputSlotMap::default(),
            reuse_frame_queue: VecDeque::new(),
            placeholder_active: false,
            seen_sync_point: false,
            frame_pool: None,
            pool_epoch: 0,
            fetch_in_flight: false,
            coded_size: Resolution::default(),
            visible_rect: Rect::default(),
            notifier,
            events,
            get_pool_cb,
            output_cb,
            error_cb,
        };
        decoder.setup_initial_output()?;
        decoder.device.start_polling(Box::new(decoder.notifier.clone()))?;
        Ok(decoder)
    }

    /// The fd signalled whenever [`EngineEvent`]s are waiting; the owner
    /// polls it and calls [`Self::process_pending_events`].
    pub fn wake_fd(&self) -> Arc<EventFd> {
        self.notifier.wake_fd()
    }

    /// Drains and dispatches all queued engine events.
    pub fn process_pending_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::ServiceDevice { has_event } => self.service_device(has_event),
                EngineEvent::FrameReady { epoch, result } => self.on_frame_ready(epoch, result),
                EngineEvent::PollError(err) => {
                    log::error!("device poller failed: {}", err);
                    self.on_error();
                }
            }
        }
    }

    /// Submits one compressed access unit. `cb` fires exactly once: with
    /// [`DecodeStatus::Ok`] when the device has consumed the data, with
    /// [`DecodeStatus::Aborted`] on flush, or with
    /// [`DecodeStatus::Error`] on device failure.
    pub fn decode(&mut self, buffer: BitstreamBuffer<D::InputBuffer>, cb: DecodeCb) {
        if self.state == State::Error {
            log::error!("decode() ignored in error state");
            cb.fire(DecodeStatus::Error);
            return;
        }
        if self.state == State::Idle {
            self.set_state(State::Decoding);
        }

        // While only the placeholder sits on the output queue, track
        // whether real content arrived. A drain is a provable no-op until
        // a sync point has been submitted. Protected content cannot be
        // inspected; assume it carries content.
        if !self.is_secure && self.placeholder_active && !self.seen_sync_point {
            if let Some(bytes) = buffer.handle.bytes() {
                if let Some(payload) = bytes.get(buffer.offset..buffer.offset + buffer.size) {
                    self.seen_sync_point = bitstream::contains_sync_point(self.codec, payload);
                }
            }
        }

        self.decode_requests.push_back(DecodeRequest { buffer: Some(buffer), cb });
        self.pump_decode_requests();
    }

    /// Requests completion of everything submitted so far. Only valid
    /// while decoding; a concurrent drain fails immediately.
    pub fn drain(&mut self, cb: DecodeCb) {
        match self.state {
            State::Idle => {
                log::debug!("nothing to drain");
                cb.fire(DecodeStatus::Ok);
            }
            State::Decoding => {
                self.decode_requests.push_back(DecodeRequest { buffer: None, cb });
                self.pump_decode_requests();
            }
            State::Draining | State::Error => {
                log::error!("drain() requested in {:?} state", self.state);
                cb.fire(DecodeStatus::Error);
            }
        }
    }

    /// Aborts all in-flight and queued work, restarts both device queues
    /// and returns to idle. Picture buffers that were on the device are
    /// kept on a reuse queue instead of being refetched from the pool.
    pub fn flush(&mut self) {
        match self.state {
            State::Idle => {
                log::debug!("nothing to flush");
                return;
            }
            State::Error => {
                log::error!("flush() ignored in error state");
                return;
            }
            State::Decoding | State::Draining => {}
        }

        self.abort_all_requests(DecodeStatus::Aborted);

        let was_output_streaming = self.output_streaming;
        if let Err(err) = self.restart_queues(was_output_streaming) {
            log::error!("flush failed: {}", err);
            self.on_error();
            return;
        }

        // Every output buffer was just dropped from the queue, so the
        // usual refill trigger (an output dequeue) will not come.
        if self.frame_pool.is_some() {
            self.try_fetch_video_frame();
        }

        if let Err(err) = self.device.start_polling(Box::new(self.notifier.clone())) {
            log::error!("failed to restart polling: {}", err);
            self.on_error();
            return;
        }
        self.set_state(State::Idle);
    }

    fn setup_initial_output(&mut self) -> Result<(), DecoderError> {
        self.select_output_format()?;
        self.start_output_queue(1)?;

        // Queue one throwaway frame so an early drain has a buffer the
        // driver can return with the last-buffer flag. Downstream
        // timeout heuristics rely on that signal arriving.
        let placeholder_size = self.coded_size.get_area() * 3 / 2;
        let frame = self.device.allocate_placeholder_frame(placeholder_size)?;
        self.device.queue_output(0, &frame)?;
        self.frame_at_device.insert(0, frame);
        self.placeholder_active = true;
        Ok(())
    }

    /// Negotiates the first output pixel format both the device and the
    /// rest of the pipeline understand.
    fn select_output_format(&mut self) -> Result<(), DecoderError> {
        let supported = self.device.supported_output_formats()?;
        for fourcc in SUPPORTED_OUTPUT_FOURCCS {
            if !supported.contains(&fourcc) {
                continue;
            }
            if self.device.set_output_format(fourcc).is_ok() {
                return Ok(());
            }
        }
        Err(DecoderError::NoOutputFormat)
    }

    /// (Re)allocates and restarts the output queue for the device's
    /// currently negotiated format, clearing all slot bindings.
    fn start_output_queue(&mut self, min_buffers: usize) -> Result<(), DecoderError> {
        let num_buffers =
            (self.device.min_output_buffers()? + NUM_EXTRA_OUTPUT_BUFFERS).max(min_buffers);
        self.select_output_format()?;
        let (coded_size, fourcc) = self.device.output_format()?;
        if coded_size.is_empty() {
            return Err(DecoderError::EmptyCodedSize);
        }
        self.coded_size = coded_size;
        self.visible_rect = self.query_visible_rect(coded_size);
        log::info!(
            "output queue: {} buffers of {} ({}), visible rect {}",
            num_buffers,
            coded_size,
            fourcc,
            self.visible_rect
        );

        if self.output_streaming {
            self.device.stream_off(QueueDirection::Output)?;
            self.output_streaming = false;
        }
        if self.num_output_slots > 0 {
            self.device.allocate_buffers(QueueDirection::Output, 0)?;
        }
        self.frame_at_device.clear();
        self.slot_map.clear();
        self.reuse_frame_queue.clear();

        let granted = self.device.allocate_buffers(QueueDirection::Output, num_buffers)?;
        if granted == 0 {
            return Err(DecoderError::Allocation("output"));
        }
        self.num_output_slots = granted;
        self.device.stream_on(QueueDirection::Output)?;
        self.output_streaming = true;
        Ok(())
    }

    fn query_visible_rect(&mut self, coded_size: Resolution) -> Rect {
        let rect = match self.device.visible_rect() {
            Ok(rect) => rect,
            Err(err) => {
                log::warn!("failed to query visible rect: {}", err);
                return Rect::from(coded_size);
            }
        };
        if rect.is_empty() || !resolution_contains_rect(coded_size, rect) {
            log::warn!("visible rect {} invalid for coded size {}", rect, coded_size);
            return Rect::from(coded_size);
        }
        rect
    }

    /// Level-triggered submission loop. Called whenever state changes or
    /// input slots free up; stops as soon as a request cannot proceed.
    fn pump_decode_requests(&mut self) {
        if self.state != State::Decoding {
            return;
        }

        while let Some(front) = self.decode_requests.front() {
            if front.buffer.is_none() {
                // Hold the stop command until every input buffer has been
                // consumed: a queued buffer may still trigger a resolution
                // change, and the driver would mark a buffer as last while
                // undecoded input remains.
                if self.input_slots.queued_count() > 0 {
                    log::debug!("drain waits for input buffers to be consumed");
                    return;
                }
                // Without a streaming output queue the last-buffer marker
                // can never be dequeued. Happens when the first resolution
                // change event is still pending.
                if !self.output_streaming {
                    log::debug!("drain waits for output queue streaming");
                    return;
                }

                let request = match self.decode_requests.pop_front() {
                    Some(request) => request,
                    None => return,
                };

                // No sync point was ever submitted while only the
                // placeholder is queued: the device provably has nothing
                // to deliver, so complete without a device round-trip.
                if self.placeholder_active && !self.seen_sync_point {
                    log::debug!("drain of an empty stream, completing immediately");
                    request.cb.fire(DecodeStatus::Ok);
                    return;
                }

                if let Err(err) = self.device.send_stop_command() {
                    log::error!("failed to send stop command: {}", err);
                    request.cb.fire(DecodeStatus::Error);
                    self.on_error();
                    return;
                }
                self.drain_cb = Some(request.cb);
                self.set_state(State::Draining);
                return;
            }

            let backing_id = match front.buffer.as_ref() {
                Some(buffer) => buffer.handle.id(),
                None => return,
            };
            let slot = match self.input_slots.claim(backing_id) {
                Some(slot) => slot,
                None => {
                    // Resumed once input dequeues free a slot.
                    log::debug!("no free input slot");
                    return;
                }
            };

            let request = match self.decode_requests.pop_front() {
                Some(request) => request,
                None => return,
            };
            let buffer = match request.buffer {
                Some(buffer) => buffer,
                None => return,
            };
            log::debug!("queuing bitstream buffer {} into input slot {}", buffer.bitstream_id, slot);
            if let Err(err) = self.device.queue_input(
                slot,
                buffer.bitstream_id,
                &buffer.handle,
                buffer.offset,
                buffer.size,
            ) {
                log::error!("failed to queue input buffer {}: {}", buffer.bitstream_id, err);
                request.cb.fire(DecodeStatus::Error);
                self.on_error();
                return;
            }
            if let Some(stale) = self.pending_decode_cbs.insert(buffer.bitstream_id, request.cb) {
                log::error!("duplicate bitstream id {}", buffer.bitstream_id);
                debug_assert!(false, "duplicate bitstream id");
                stale.fire(DecodeStatus::Error);
            }
        }
    }

    fn service_device(&mut self, has_event: bool) {
        if self.state == State::Error {
            return;
        }
        if let Err(err) = self.try_service_device(has_event) {
            log::error!("device servicing failed: {}", err);
            self.on_error();
        }
    }

    fn try_service_device(&mut self, has_event: bool) -> Result<(), DecoderError> {
        let mut input_dequeued = false;
        while let Some(done) = self.device.dequeue_input()? {
            input_dequeued = true;
            self.input_slots.release(done.slot);
            log::debug!("input slot {} consumed, bitstream id {}", done.slot, done.bitstream_id);
            match self.pending_decode_cbs.remove(&done.bitstream_id) {
                Some(cb) => cb.fire(DecodeStatus::Ok),
                None => {
                    log::warn!("callback for bitstream id {} already abandoned", done.bitstream_id)
                }
            }
        }

        let mut output_dequeued = false;
        while let Some(done) = self.device.dequeue_output()? {
            output_dequeued = true;
            let frame = match self.frame_at_device.remove(&done.slot) {
                Some(frame) => frame,
                None => {
                    log::error!("dequeued output slot {} has no frame at device", done.slot);
                    debug_assert!(false, "dequeued output slot without frame");
                    return Err(DecoderError::Accounting("dequeued output slot without frame"));
                }
            };

            if done.bytes_used > 0 {
                log::debug!(
                    "emitting frame for bitstream id {} from slot {}",
                    done.bitstream_id,
                    done.slot
                );
                (self.output_cb)(DecodedFrame {
                    frame,
                    bitstream_id: done.bitstream_id,
                    visible_rect: self.visible_rect,
                });
            } else {
                // A payload-less buffer must go straight back on the
                // queue; if it sits here past the next drain the driver
                // fails to signal completion.
                log::debug!("recycling empty output slot {}", done.slot);
                self.device.queue_output(done.slot, &frame)?;
                self.frame_at_device.insert(done.slot, frame);
            }

            // The last-buffer flag alone decides drain completion; the
            // payload size above is deliberately not consulted.
            if done.is_last {
                if let Some(cb) = self.drain_cb.take() {
                    log::debug!("all buffers drained");
                    // The callback is already out of drain_cb, so the
                    // error path must fire it here or it never fires.
                    if let Err(err) = self.device.send_start_command() {
                        cb.fire(DecodeStatus::Error);
                        return Err(err.into());
                    }
                    cb.fire(DecodeStatus::Ok);
                    self.set_state(State::Idle);
                }
            }
        }

        if has_event && self.device.dequeue_source_change()? {
            self.change_resolution()?;
        }
        if input_dequeued {
            self.pump_decode_requests();
        }
        // No pool exists until the first resolution change; a dequeue of
        // the placeholder must not demand one.
        if output_dequeued && !self.placeholder_active {
            self.try_fetch_video_frame();
        }
        Ok(())
    }

    fn change_resolution(&mut self) -> Result<(), DecoderError> {
        log::info!("handling resolution change");
        self.placeholder_active = false;

        self.start_output_queue(self.min_num_output_buffers)?;

        // A drain marker stalled on the non-streaming output queue can
        // proceed now.
        if matches!(self.decode_requests.front(), Some(request) if request.buffer.is_none()) {
            self.pump_decode_requests();
        }

        // Drop the previous pool before requesting a new one; two live
        // pools would double-claim the caller's buffer quota.
        self.frame_pool = None;
        self.fetch_in_flight = false;
        self.pool_epoch += 1;
        let spec = PoolSpec {
            coded_size: self.coded_size,
            visible_rect: self.visible_rect,
            num_buffers: self.num_output_slots,
            epoch: self.pool_epoch,
            notifier: self.notifier.clone(),
        };
        self.frame_pool = (self.get_pool_cb)(spec);
        if self.frame_pool.is_none() {
            return Err(DecoderError::PoolCreation(self.coded_size));
        }

        self.try_fetch_video_frame();
        Ok(())
    }

    /// Keeps the output queue stocked: requeues flushed frames first,
    /// otherwise starts a pool fetch. At most one fetch is in flight.
    fn try_fetch_video_frame(&mut self) {
        if self.frame_pool.is_none() {
            log::error!("no frame pool, was the resolution change handled?");
            self.on_error();
            return;
        }
        if self.frame_at_device.len() >= self.num_output_slots {
            log::debug!("no free output slot");
            return;
        }

        if let Some((block_id, frame)) = self.reuse_frame_queue.pop_front() {
            self.on_frame_ready(self.pool_epoch, Some((frame, block_id)));
            return;
        }

        if self.fetch_in_flight {
            return;
        }
        if let Some(pool) = self.frame_pool.as_mut() {
            if pool.fetch() {
                self.fetch_in_flight = true;
            }
        }
    }

    fn on_frame_ready(&mut self, epoch: u64, result: Option<(D::Frame, u64)>) {
        if epoch != self.pool_epoch {
            log::debug!("dropping fetch result from stale pool epoch {}", epoch);
            return;
        }
        self.fetch_in_flight = false;
        if self.state == State::Error {
            return;
        }

        let (frame, block_id) = match result {
            Some(frame_with_block_id) => frame_with_block_id,
            None => {
                log::error!("frame pool failed to provide a picture buffer");
                self.on_error();
                return;
            }
        };

        let slot = match self.slot_map.slot_for_block(block_id) {
            Some(slot) => {
                if self.frame_at_device.contains_key(&slot) {
                    // The allocator's slot cache can hand out a buffer
                    // that is still enqueued here. Dropping the duplicate
                    // is safe; the allocation stays alive on the original
                    // reference.
                    log::warn!("block {} supplied again while already enqueued", block_id);
                    self.try_fetch_video_frame();
                    return;
                }
                slot
            }
            None if self.slot_map.len() < self.num_output_slots => {
                self.slot_map.bind_next(block_id)
            }
            None => {
                log::error!("more distinct block ids than output slots");
                debug_assert!(false, "pool delivered more block ids than output slots");
                self.on_error();
                return;
            }
        };

        log::debug!("queuing block {} into output slot {}", block_id, slot);
        if let Err(err) = self.device.queue_output(slot, &frame) {
            log::error!("failed to queue output slot {}: {}", slot, err);
            self.on_error();
            return;
        }
        if self.frame_at_device.insert(slot, frame).is_some() {
            log::error!("output slot {} was already holding a frame", slot);
            debug_assert!(false, "double-queued output slot");
            self.on_error();
            return;
        }

        self.try_fetch_video_frame();
    }

    fn restart_queues(&mut self, restart_output: bool) -> Result<(), DecoderError> {
        self.device.stop_polling()?;

        self.device.stream_off(QueueDirection::Output)?;
        self.output_streaming = false;
        // The dropped output buffers still hold valid allocations; park
        // them for requeueing instead of round-tripping through the pool.
        for (slot, frame) in std::mem::take(&mut self.frame_at_device) {
            match self.slot_map.block_for_slot(slot) {
                Some(block_id) => self.reuse_frame_queue.push_back((block_id, frame)),
                None if self.placeholder_active => drop(frame),
                None => {
                    log::error!("queued output slot {} has no block binding", slot);
                    debug_assert!(false, "output slot without block binding");
                }
            }
        }

        self.device.stream_off(QueueDirection::Input)?;
        self.input_slots.release_all();

        self.device.stream_on(QueueDirection::Input)?;
        if restart_output {
            self.device.stream_on(QueueDirection::Output)?;
            self.output_streaming = true;
        }
        Ok(())
    }

    fn abort_all_requests(&mut self, status: DecodeStatus) {
        for (_, cb) in std::mem::take(&mut self.pending_decode_cbs) {
            cb.fire(status);
        }
        if let Some(cb) = self.drain_cb.take() {
            cb.fire(status);
        }
        for request in std::mem::take(&mut self.decode_requests) {
            request.cb.fire(status);
        }
    }

    fn on_error(&mut self) {
        if self.state == State::Error {
            return;
        }
        self.set_state(State::Error);
        // Complete every outstanding request so the caller can tear down
        // without waiting on callbacks that would never fire.
        self.abort_all_requests(DecodeStatus::Error);
        (self.error_cb)();
    }

    fn set_state(&mut self, new_state: State) {
        if self.state == new_state || self.state == State::Error {
            return;
        }
        let new_state = if new_state == State::Draining && self.state != State::Decoding {
            log::error!("draining requested from {:?} state", self.state);
            debug_assert!(false, "draining requested outside of decoding");
            State::Error
        } else {
            new_state
        };
        log::info!("decoder state {:?} => {:?}", self.state, new_state);
        self.state = new_state;
    }
}

impl<D: StatefulDevice> Drop for StatefulDecoder<D> {
    fn drop(&mut self) {
        self.abort_all_requests(DecodeStatus::Aborted);
        if let Err(err) = self.device.stop_polling() {
            log::warn!("failed to stop polling on teardown: {}", err);
        }
        for direction in [QueueDirection::Output, QueueDirection::Input] {
            if let Err(err) = self.device.stream_off(direction) {
                log::warn!("failed to stream off {:?} queue on teardown: {}", direction, err);
            }
            if let Err(err) = self.device.allocate_buffers(direction, 0) {
                log::warn!("failed to release {:?} buffers on teardown: {}", direction, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DequeuedInput;
    use crate::device::DequeuedOutput;
    use crate::device::ServiceNotifier;
    use std::sync::Arc;
    use std::sync::Mutex;

    const DRAIN_ID: i32 = -1;
    const SECOND_DRAIN_ID: i32 = -2;
    const PLACEHOLDER_FRAME: u32 = u32::MAX;

    // One IDR slice; a sync point for H.264.
    const IDR_UNIT: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
    // SPS only; not a sync point.
    const SPS_UNIT: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e];

    #[derive(Default)]
    struct MockState {
        input_allocated: usize,
        output_allocated: usize,
        input_streaming: bool,
        output_streaming: bool,
        polling: bool,

        queued_inputs: Vec<(usize, i32)>,
        ready_inputs: VecDeque<DequeuedInput>,
        /// Every queue_output call, in order.
        output_queue_history: Vec<(usize, u32)>,
        outputs_at_device: Vec<usize>,
        ready_outputs: VecDeque<DequeuedOutput>,

        source_change_pending: bool,
        stop_commands: usize,
        start_commands: usize,
        fail_stop_command: bool,
        fail_start_command: bool,

        min_output_buffers: usize,
        coded_size: Resolution,
        visible_rect: Option<Rect>,
    }

    struct MockDevice {
        state: Arc<Mutex<MockState>>,
    }

    impl StatefulDevice for MockDevice {
        type InputBuffer = Vec<u8>;
        type Frame = u32;

        fn supported_input_formats(&self) -> Result<Vec<Fourcc>, DeviceError> {
            Ok(vec![
                VideoCodec::H264.fourcc(),
                VideoCodec::H265.fourcc(),
                VideoCodec::VP8.fourcc(),
                VideoCodec::VP9.fourcc(),
            ])
        }

        fn supported_output_formats(&self) -> Result<Vec<Fourcc>, DeviceError> {
            Ok(vec![Fourcc::from_bytes(b"NV12")])
        }

        fn set_input_format(
            &mut self,
            _fourcc: Fourcc,
            _buffer_size: usize,
        ) -> Result<(), DeviceError> {
            Ok(())
        }

        fn set_output_format(&mut self, _fourcc: Fourcc) -> Result<(), DeviceError> {
            Ok(())
        }

        fn output_format(&self) -> Result<(Resolution, Fourcc), DeviceError> {
            Ok((self.state.lock().unwrap().coded_size, Fourcc::from_bytes(b"NV12")))
        }

        fn min_output_buffers(&self) -> Result<usize, DeviceError> {
            Ok(self.state.lock().unwrap().min_output_buffers)
        }

        fn visible_rect(&self) -> Result<Rect, DeviceError> {
            self.state
                .lock()
                .unwrap()
                .visible_rect
                .ok_or_else(|| DeviceError::ioctl("g_selection", "not supported"))
        }

        fn allocate_buffers(
            &mut self,
            direction: QueueDirection,
            count: usize,
        ) -> Result<usize, DeviceError> {
            let mut state = self.state.lock().unwrap();
            match direction {
                QueueDirection::Input => {
                    state.input_allocated = count;
                    state.queued_inputs.clear();
                }
                QueueDirection::Output => {
                    state.output_allocated = count;
                    state.outputs_at_device.clear();
                }
            }
            Ok(count)
        }

        fn stream_on(&mut self, direction: QueueDirection) -> Result<(), DeviceError> {
            let mut state = self.state.lock().unwrap();
            match direction {
                QueueDirection::Input => state.input_streaming = true,
                QueueDirection::Output => state.output_streaming = true,
            }
            Ok(())
        }

        fn stream_off(&mut self, direction: QueueDirection) -> Result<(), DeviceError> {
            let mut state = self.state.lock().unwrap();
            match direction {
                QueueDirection::Input => {
                    state.input_streaming = false;
                    state.queued_inputs.clear();
                }
                QueueDirection::Output => {
                    state.output_streaming = false;
                    state.outputs_at_device.clear();
                }
            }
            Ok(())
        }

        fn queue_input(
            &mut self,
            slot: usize,
            bitstream_id: i32,
            _buffer: &Vec<u8>,
            _offset: usize,
            _size: usize,
        ) -> Result<(), DeviceError> {
            self.state.lock().unwrap().queued_inputs.push((slot, bitstream_id));
            Ok(())
        }

        fn dequeue_input(&mut self) -> Result<Option<DequeuedInput>, DeviceError> {
            let mut state = self.state.lock().unwrap();
            let Some(done) = state.ready_inputs.pop_front() else {
                return Ok(None);
            };
            state.queued_inputs.retain(|&(slot, _)| slot != done.slot);
            Ok(Some(done))
        }

        fn queue_output(&mut self, slot: usize, frame: &u32) -> Result<(), DeviceError> {
            let mut state = self.state.lock().unwrap();
            state.output_queue_history.push((slot, *frame));
            state.outputs_at_device.push(slot);
            Ok(())
        }

        fn dequeue_output(&mut self) -> Result<Option<DequeuedOutput>, DeviceError> {
            let mut state = self.state.lock().unwrap();
            let Some(done) = state.ready_outputs.pop_front() else {
                return Ok(None);
            };
            state.outputs_at_device.retain(|&slot| slot != done.slot);
            Ok(Some(done))
        }

        fn subscribe_source_change(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn dequeue_source_change(&mut self) -> Result<bool, DeviceError> {
            Ok(std::mem::take(&mut self.state.lock().unwrap().source_change_pending))
        }

        fn supports_drain_commands(&self) -> Result<bool, DeviceError> {
            Ok(true)
        }

        fn send_stop_command(&mut self) -> Result<(), DeviceError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_stop_command {
                return Err(DeviceError::ioctl("decoder_cmd", "injected failure"));
            }
            state.stop_commands += 1;
            Ok(())
        }

        fn send_start_command(&mut self) -> Result<(), DeviceError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_start_command {
                return Err(DeviceError::ioctl("decoder_cmd", "injected failure"));
            }
            state.start_commands += 1;
            Ok(())
        }

        fn start_polling(
            &mut self,
            _notifier: Box<dyn ServiceNotifier>,
        ) -> Result<(), DeviceError> {
            self.state.lock().unwrap().polling = true;
            Ok(())
        }

        fn stop_polling(&mut self) -> Result<(), DeviceError> {
            self.state.lock().unwrap().polling = false;
            Ok(())
        }

        fn allocate_placeholder_frame(&mut self, _size: usize) -> Result<u32, DeviceError> {
            Ok(PLACEHOLDER_FRAME)
        }
    }

    #[derive(Default)]
    struct TestPoolState {
        notifier: Option<EngineNotifier<u32>>,
        epoch: u64,
        num_buffers: usize,
        pools_created: usize,
        fetches: usize,
        pending: usize,
        max_pending: usize,
    }

    struct TestPool {
        state: Arc<Mutex<TestPoolState>>,
    }

    impl FramePool<u32> for TestPool {
        fn fetch(&mut self) -> bool {
            let mut state = self.state.lock().unwrap();
            state.fetches += 1;
            state.pending += 1;
            state.max_pending = state.max_pending.max(state.pending);
            true
        }
    }

    struct Harness {
        decoder: StatefulDecoder<MockDevice>,
        device: Arc<Mutex<MockState>>,
        pool: Arc<Mutex<TestPoolState>>,
        statuses: Arc<Mutex<Vec<(i32, DecodeStatus)>>>,
        outputs: Arc<Mutex<Vec<(i32, u32, Rect)>>>,
        errors: Arc<Mutex<usize>>,
    }

    impl Harness {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let device = Arc::new(Mutex::new(MockState {
                min_output_buffers: 2,
                coded_size: Resolution::new(320, 240),
                visible_rect: Some(Rect { x: 0, y: 0, width: 320, height: 240 }),
                ..Default::default()
            }));
            let pool = Arc::new(Mutex::new(TestPoolState::default()));
            let statuses = Arc::new(Mutex::new(Vec::new()));
            let outputs = Arc::new(Mutex::new(Vec::new()));
            let errors = Arc::new(Mutex::new(0));

            let pool_for_cb = pool.clone();
            let get_pool_cb: GetPoolCb<u32> = Box::new(move |spec| {
                let mut state = pool_for_cb.lock().unwrap();
                state.notifier = Some(spec.notifier);
                state.epoch = spec.epoch;
                state.num_buffers = spec.num_buffers;
                state.pools_created += 1;
                Some(Box::new(TestPool { state: pool_for_cb.clone() }))
            });
            let outputs_for_cb = outputs.clone();
            let output_cb: OutputCb<u32> = Box::new(move |frame| {
                outputs_for_cb.lock().unwrap().push((
                    frame.bitstream_id,
                    frame.frame,
                    frame.visible_rect,
                ));
            });
            let errors_for_cb = errors.clone();
            let error_cb: ErrorCb = Box::new(move || {
                *errors_for_cb.lock().unwrap() += 1;
            });

            let decoder = StatefulDecoder::new(
                MockDevice { state: device.clone() },
                VideoCodec::H264,
                1 << 20,
                4,
                false,
                get_pool_cb,
                output_cb,
                error_cb,
            )
            .expect("failed to create decoder");

            Self { decoder, device, pool, statuses, outputs, errors }
        }

        fn decode(&mut self, bitstream_id: i32, data: &[u8]) {
            let statuses = self.statuses.clone();
            let cb = DecodeCb::new(move |status| {
                statuses.lock().unwrap().push((bitstream_id, status));
            });
            let handle = data.to_vec();
            let size = handle.len();
            self.decoder.decode(BitstreamBuffer { bitstream_id, handle, offset: 0, size }, cb);
        }

        fn drain(&mut self, label: i32) {
            let statuses = self.statuses.clone();
            let cb = DecodeCb::new(move |status| {
                statuses.lock().unwrap().push((label, status));
            });
            self.decoder.drain(cb);
        }

        /// Marks queued input buffers as consumed by the device and
        /// services the queues.
        fn complete_inputs(&mut self, completions: &[(usize, i32)]) {
            {
                let mut device = self.device.lock().unwrap();
                for &(slot, bitstream_id) in completions {
                    device.ready_inputs.push_back(DequeuedInput { slot, bitstream_id });
                }
            }
            self.decoder.service_device(false);
        }

        fn complete_output(&mut self, done: DequeuedOutput) {
            self.device.lock().unwrap().ready_outputs.push_back(done);
            self.decoder.service_device(false);
        }

        fn trigger_resolution_change(&mut self, coded_size: Resolution) {
            {
                let mut device = self.device.lock().unwrap();
                device.source_change_pending = true;
                device.coded_size = coded_size;
                device.visible_rect =
                    Some(Rect { x: 0, y: 0, width: coded_size.width, height: coded_size.height });
            }
            self.decoder.service_device(true);
        }

        /// Completes the outstanding pool fetch with `result`.
        fn deliver_frame(&mut self, result: Option<(u32, u64)>) {
            let (notifier, epoch) = {
                let mut state = self.pool.lock().unwrap();
                assert!(state.pending > 0, "no fetch outstanding");
                state.pending -= 1;
                (state.notifier.clone().expect("no pool created"), state.epoch)
            };
            notifier.post(EngineEvent::FrameReady { epoch, result });
            self.decoder.process_pending_events();
        }

        fn statuses(&self) -> Vec<(i32, DecodeStatus)> {
            self.statuses.lock().unwrap().clone()
        }
    }

    #[test]
    fn creation_primes_queues() {
        let harness = Harness::new();
        let device = harness.device.lock().unwrap();
        assert_eq!(device.input_allocated, NUM_INPUT_BUFFERS);
        assert!(device.input_streaming);
        // Driver minimum 2 plus pipeline margin.
        assert_eq!(device.output_allocated, 2 + NUM_EXTRA_OUTPUT_BUFFERS);
        assert!(device.output_streaming);
        assert!(device.polling);
        // The placeholder sits on slot 0.
        assert_eq!(device.output_queue_history, vec![(0, PLACEHOLDER_FRAME)]);
        assert_eq!(device.stop_commands, 0);
    }

    #[test]
    fn drain_on_idle_completes_without_device_roundtrip() {
        let mut harness = Harness::new();
        harness.drain(DRAIN_ID);
        assert_eq!(harness.statuses(), vec![(DRAIN_ID, DecodeStatus::Ok)]);
        assert_eq!(harness.device.lock().unwrap().stop_commands, 0);
    }

    #[test]
    fn drain_without_sync_point_short_circuits() {
        let mut harness = Harness::new();
        // Parameter sets alone carry no decodable content.
        harness.decode(1, SPS_UNIT);
        harness.complete_inputs(&[(0, 1)]);
        harness.drain(DRAIN_ID);
        assert_eq!(
            harness.statuses(),
            vec![(1, DecodeStatus::Ok), (DRAIN_ID, DecodeStatus::Ok)]
        );
        assert_eq!(harness.device.lock().unwrap().stop_commands, 0);
    }

    #[test]
    fn decode_callbacks_follow_device_completion_order() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.decode(2, IDR_UNIT);
        harness.decode(3, IDR_UNIT);
        // The device consumes slot 1 before slot 0.
        harness.complete_inputs(&[(1, 2), (0, 1), (2, 3)]);
        assert_eq!(
            harness.statuses(),
            vec![(2, DecodeStatus::Ok), (1, DecodeStatus::Ok), (3, DecodeStatus::Ok)]
        );
    }

    #[test]
    fn drain_fires_after_all_decode_callbacks() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.decode(2, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        harness.deliver_frame(Some((100, 100)));
        harness.deliver_frame(Some((101, 101)));

        harness.drain(DRAIN_ID);
        // The stop command waits until all input buffers are consumed.
        assert_eq!(harness.device.lock().unwrap().stop_commands, 0);

        harness.complete_inputs(&[(0, 1), (1, 2)]);
        assert_eq!(harness.device.lock().unwrap().stop_commands, 1);

        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 1,
            bytes_used: 1000,
            is_last: false,
        });
        harness.complete_output(DequeuedOutput {
            slot: 1,
            bitstream_id: 2,
            bytes_used: 1000,
            is_last: true,
        });

        assert_eq!(
            harness.statuses(),
            vec![
                (1, DecodeStatus::Ok),
                (2, DecodeStatus::Ok),
                (DRAIN_ID, DecodeStatus::Ok),
            ]
        );
        let device = harness.device.lock().unwrap();
        assert_eq!(device.start_commands, 1);
        drop(device);
        let outputs = harness.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].0, 1);
        assert_eq!(outputs[1].0, 2);
    }

    #[test]
    fn drain_completes_via_recycled_placeholder() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.complete_inputs(&[(0, 1)]);
        harness.drain(DRAIN_ID);
        assert_eq!(harness.device.lock().unwrap().stop_commands, 1);

        // The driver hands back the placeholder with no payload and the
        // last-buffer flag; it must be requeued, not emitted.
        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 0,
            bytes_used: 0,
            is_last: true,
        });
        assert_eq!(
            harness.statuses(),
            vec![(1, DecodeStatus::Ok), (DRAIN_ID, DecodeStatus::Ok)]
        );
        assert!(harness.outputs.lock().unwrap().is_empty());
        let device = harness.device.lock().unwrap();
        assert_eq!(
            device.output_queue_history,
            vec![(0, PLACEHOLDER_FRAME), (0, PLACEHOLDER_FRAME)]
        );
        assert_eq!(device.start_commands, 1);
    }

    #[test]
    fn start_command_failure_still_fires_the_drain_callback() {
        let mut harness = Harness::new();
        harness.device.lock().unwrap().fail_start_command = true;
        harness.decode(1, IDR_UNIT);
        harness.complete_inputs(&[(0, 1)]);
        harness.drain(DRAIN_ID);

        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 0,
            bytes_used: 0,
            is_last: true,
        });
        assert_eq!(
            harness.statuses(),
            vec![(1, DecodeStatus::Ok), (DRAIN_ID, DecodeStatus::Error)]
        );
        assert_eq!(*harness.errors.lock().unwrap(), 1);
        assert_eq!(harness.decoder.state, State::Error);
    }

    #[test]
    fn concurrent_drain_fails_without_disturbing_first() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.complete_inputs(&[(0, 1)]);
        harness.drain(DRAIN_ID);
        harness.drain(SECOND_DRAIN_ID);
        assert_eq!(
            harness.statuses(),
            vec![(1, DecodeStatus::Ok), (SECOND_DRAIN_ID, DecodeStatus::Error)]
        );

        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 0,
            bytes_used: 0,
            is_last: true,
        });
        assert_eq!(
            harness.statuses().last(),
            Some(&(DRAIN_ID, DecodeStatus::Ok))
        );
        assert_eq!(*harness.errors.lock().unwrap(), 0);
    }

    #[test]
    fn flush_aborts_everything_and_returns_to_idle() {
        let mut harness = Harness::new();
        // Fill every input slot, plus one request that stays queued.
        for id in 0..(NUM_INPUT_BUFFERS as i32 + 1) {
            harness.decode(id, IDR_UNIT);
        }
        assert_eq!(
            harness.device.lock().unwrap().queued_inputs.len(),
            NUM_INPUT_BUFFERS
        );

        harness.decoder.flush();

        let statuses = harness.statuses();
        assert_eq!(statuses.len(), NUM_INPUT_BUFFERS + 1);
        assert!(statuses.iter().all(|&(_, status)| status == DecodeStatus::Aborted));
        assert_eq!(harness.decoder.state, State::Idle);
        let device = harness.device.lock().unwrap();
        assert!(device.polling);
        assert!(device.input_streaming);
        // A second flush while idle is a no-op.
        drop(device);
        harness.decoder.flush();
        assert_eq!(harness.statuses().len(), NUM_INPUT_BUFFERS + 1);
    }

    #[test]
    fn flush_preserves_device_frames_on_reuse_queue() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        harness.deliver_frame(Some((100, 100)));
        harness.deliver_frame(Some((101, 101)));
        let queued_before = harness.device.lock().unwrap().output_queue_history.len();

        harness.decoder.flush();

        // Both frames went through the reuse queue straight back to the
        // device, keeping their original slot bindings.
        assert!(harness.decoder.reuse_frame_queue.is_empty());
        let device = harness.device.lock().unwrap();
        let requeued: Vec<usize> = device.output_queue_history[queued_before..]
            .iter()
            .map(|&(slot, _)| slot)
            .collect();
        assert_eq!(requeued, vec![0, 1]);
        assert_eq!(*harness.errors.lock().unwrap(), 0);
    }

    #[test]
    fn resolution_change_resets_block_bindings() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        assert_eq!(harness.pool.lock().unwrap().pools_created, 1);
        harness.deliver_frame(Some((100, 100)));
        harness.deliver_frame(Some((101, 101)));
        assert_eq!(harness.decoder.slot_map.slot_for_block(101), Some(1));

        harness.trigger_resolution_change(Resolution::new(1280, 720));
        assert_eq!(harness.pool.lock().unwrap().pools_created, 2);
        assert_eq!(harness.decoder.slot_map.len(), 0);

        // In the new epoch the same block may land on a different slot.
        harness.deliver_frame(Some((101, 101)));
        assert_eq!(harness.decoder.slot_map.slot_for_block(101), Some(0));
    }

    #[test]
    fn stale_pool_results_are_ignored() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        let old_epoch = harness.pool.lock().unwrap().epoch;
        harness.trigger_resolution_change(Resolution::new(1280, 720));

        let queued_before = harness.device.lock().unwrap().output_queue_history.len();
        let notifier = harness.pool.lock().unwrap().notifier.clone().unwrap();
        notifier.post(EngineEvent::FrameReady { epoch: old_epoch, result: Some((55, 55)) });
        harness.decoder.process_pending_events();

        assert_eq!(
            harness.device.lock().unwrap().output_queue_history.len(),
            queued_before
        );
        assert_eq!(*harness.errors.lock().unwrap(), 0);
    }

    #[test]
    fn at_most_one_fetch_outstanding() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));

        let num_slots = harness.decoder.num_output_slots;
        for block in 0..num_slots as u64 {
            harness.deliver_frame(Some((block as u32, block)));
        }
        let pool = harness.pool.lock().unwrap();
        assert_eq!(pool.max_pending, 1);
        // The queue is full; no further fetch may be outstanding.
        assert_eq!(pool.pending, 0);
        assert_eq!(pool.fetches, num_slots);
    }

    #[test]
    fn empty_output_buffer_is_recycled_not_emitted() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        harness.deliver_frame(Some((100, 100)));
        let frames_at_device = harness.decoder.frame_at_device.len();

        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 7,
            bytes_used: 0,
            is_last: false,
        });

        assert!(harness.outputs.lock().unwrap().is_empty());
        assert_eq!(harness.decoder.frame_at_device.len(), frames_at_device);
        // Queued once from the pool and once from recycling.
        let device = harness.device.lock().unwrap();
        let slot0_queues = device
            .output_queue_history
            .iter()
            .filter(|&&(slot, frame)| slot == 0 && frame == 100)
            .count();
        assert_eq!(slot0_queues, 2);
    }

    #[test]
    fn recurring_block_id_reuses_its_slot() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));
        harness.deliver_frame(Some((100, 7)));
        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 1,
            bytes_used: 1000,
            is_last: false,
        });
        assert_eq!(harness.outputs.lock().unwrap().len(), 1);

        // The same block comes back from the pool; it must return to
        // slot 0 rather than claim a new one.
        harness.deliver_frame(Some((100, 7)));
        assert_eq!(harness.decoder.slot_map.len(), 1);
        assert_eq!(
            harness.device.lock().unwrap().output_queue_history.last(),
            Some(&(0, 100))
        );
    }

    #[test]
    fn emitted_frames_carry_the_visible_rect() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        {
            let mut device = harness.device.lock().unwrap();
            device.source_change_pending = true;
            device.coded_size = Resolution::new(1920, 1088);
            device.visible_rect = Some(Rect { x: 0, y: 0, width: 1920, height: 1080 });
        }
        harness.decoder.service_device(true);
        harness.deliver_frame(Some((100, 100)));
        harness.complete_output(DequeuedOutput {
            slot: 0,
            bitstream_id: 1,
            bytes_used: 1000,
            is_last: false,
        });
        let outputs = harness.outputs.lock().unwrap();
        assert_eq!(outputs[0].2, Rect { x: 0, y: 0, width: 1920, height: 1080 });
    }

    #[test]
    fn degenerate_visible_rect_falls_back_to_coded_size() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        {
            let mut device = harness.device.lock().unwrap();
            device.source_change_pending = true;
            device.coded_size = Resolution::new(640, 480);
            // Crop extends past the coded size.
            device.visible_rect = Some(Rect { x: 0, y: 0, width: 1920, height: 1080 });
        }
        harness.decoder.service_device(true);
        assert_eq!(
            harness.decoder.visible_rect,
            Rect { x: 0, y: 0, width: 640, height: 480 }
        );
    }

    #[test]
    fn stop_command_failure_enters_error_state() {
        let mut harness = Harness::new();
        harness.device.lock().unwrap().fail_stop_command = true;
        harness.decode(1, IDR_UNIT);
        harness.complete_inputs(&[(0, 1)]);
        harness.drain(DRAIN_ID);

        assert_eq!(
            harness.statuses(),
            vec![(1, DecodeStatus::Ok), (DRAIN_ID, DecodeStatus::Error)]
        );
        assert_eq!(*harness.errors.lock().unwrap(), 1);
        assert_eq!(harness.decoder.state, State::Error);

        // All further operations fail immediately.
        harness.decode(2, IDR_UNIT);
        assert_eq!(harness.statuses().last(), Some(&(2, DecodeStatus::Error)));
        harness.drain(SECOND_DRAIN_ID);
        assert_eq!(
            harness.statuses().last(),
            Some(&(SECOND_DRAIN_ID, DecodeStatus::Error))
        );
    }

    #[test]
    fn pool_failure_aborts_in_flight_requests() {
        let mut harness = Harness::new();
        harness.decode(1, IDR_UNIT);
        harness.decode(2, IDR_UNIT);
        harness.trigger_resolution_change(Resolution::new(640, 480));

        harness.deliver_frame(None);

        assert_eq!(*harness.errors.lock().unwrap(), 1);
        let statuses = harness.statuses();
        assert!(statuses.contains(&(1, DecodeStatus::Error)));
        assert!(statuses.contains(&(2, DecodeStatus::Error)));
    }

    #[test]
    fn input_slot_claim_prefers_identity_then_fresh_then_free() {
        let mut slots = InputSlots::new(4);
        assert_eq!(slots.claim(0xa), Some(0));
        assert_eq!(slots.claim(0xb), Some(1));
        slots.release(0);
        // Recurring backing returns to its previous slot.
        assert_eq!(slots.claim(0xa), Some(0));
        // Unknown backing takes a fresh slot.
        assert_eq!(slots.claim(0xc), Some(2));
        assert_eq!(slots.claim(0xd), Some(3));
        // Everything queued; nothing to claim.
        assert_eq!(slots.claim(0xe), None);
        // Matching slot busy; clobber a free one instead.
        slots.release(1);
        assert_eq!(slots.claim(0xa), Some(1));
    }
}
