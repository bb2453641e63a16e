// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread body for decode components: owns the stateful engine
//! and is the only thread that touches it.

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EventFd;

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use thiserror::Error;

use crate::bitstream::h264;
use crate::bitstream::h265;
use crate::bitstream::ColorAspects;
use crate::c2_wrapper::C2DecodeJob;
use crate::c2_wrapper::C2State;
use crate::c2_wrapper::C2Status;
use crate::c2_wrapper::C2Worker;
use crate::c2_wrapper::DrainMode;
use crate::c2_wrapper::Job;
use crate::decoder::stateful::StatefulDecoder;
use crate::decoder::BitstreamBuffer;
use crate::decoder::DecodeCb;
use crate::decoder::DecodeStatus;
use crate::decoder::StreamInfo;
use crate::device::StatefulDevice;
use crate::frame_pool::FetchOutcome;
use crate::frame_pool::FrameProvider;
use crate::frame_pool::VideoFramePool;
use crate::Fourcc;
use crate::VideoCodec;

// Large enough for a 1080p access unit at high bitrates.
const INPUT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum C2DecoderPollErrorWrapper {
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
}

/// Opens the kernel device the worker drives. Separated out so the
/// worker logic can be exercised against a mock device.
pub trait C2DecoderBackend {
    type DecoderOptions: Clone + Send + 'static;
    type Device: StatefulDevice<InputBuffer = Vec<u8>>;

    fn new(options: Self::DecoderOptions) -> Result<Self, String>
    where
        Self: Sized;
    fn supported_output_formats(&self, codec: VideoCodec) -> Result<Vec<Fourcc>, String>;
    fn open_device(&mut self, codec: VideoCodec) -> Result<Self::Device, String>;
    fn is_secure(&self) -> bool {
        false
    }
}

/// How many pictures the framework can hold back before returning any,
/// dominated by the codec's frame reordering window.
fn output_delay(codec: VideoCodec) -> usize {
    match codec {
        // Reordering can hold back a full DPB worth of frames.
        VideoCodec::H264 | VideoCodec::H265 => 16,
        // Up to golden, altref and last may be held as references.
        VideoCodec::VP8 => 3,
        VideoCodec::VP9 => 8,
    }
}

/// Picture buffers needed across the whole pipeline: framework output
/// slots (reorder delay plus smoothness factor), frames sitting in the
/// display path, and the decoder's own working margin.
fn min_num_output_buffers(codec: VideoCodec) -> usize {
    const SMOOTHNESS_FACTOR: usize = 4;
    const RENDERING_DEPTH: usize = 3;
    const EXTRA_FOR_DECODER: usize = 2;
    output_delay(codec) + SMOOTHNESS_FACTOR + RENDERING_DEPTH + EXTRA_FOR_DECODER
}

/// Pulls the VUI color description out of a compressed buffer for the
/// codecs that carry one in-band.
fn extract_color_aspects(codec: VideoCodec, payload: &[u8]) -> Option<ColorAspects> {
    match codec {
        VideoCodec::H264 => h264::parse_color_aspects(payload),
        VideoCodec::H265 => h265::parse_color_aspects(payload),
        VideoCodec::VP8 | VideoCodec::VP9 => None,
    }
}

/// Adapts the component's pull-style allocation callback to the frame
/// pool's provider interface. A `None` from the callback means the
/// producer is momentarily out of buffers, so the pool retries.
struct CallbackFrameProvider<F: Send + 'static> {
    alloc_cb: Arc<Mutex<dyn FnMut() -> Option<(F, u64)> + Send + 'static>>,
}

impl<F: Send + 'static> FrameProvider for CallbackFrameProvider<F> {
    type Frame = F;

    fn fetch(&mut self) -> FetchOutcome<F> {
        match (*self.alloc_cb.lock().unwrap())() {
            Some((frame, block_id)) => FetchOutcome::Ready { frame, block_id },
            None => FetchOutcome::TryAgain,
        }
    }
}

type Frame<B> = <<B as C2DecoderBackend>::Device as StatefulDevice>::Frame;

pub struct C2DecoderWorker<B>
where
    B: C2DecoderBackend,
{
    decoder: StatefulDecoder<B::Device>,
    input_codec: VideoCodec,
    secure: bool,
    // Last color description seen in the bitstream; shared with the
    // engine's output callback so frame-bearing work items carry it.
    bitstream_aspects: Arc<Mutex<Option<ColorAspects>>>,
    epoll_fd: Epoll,
    awaiting_job_event: Arc<EventFd>,
    work_done_cb: Arc<Mutex<dyn FnMut(C2DecodeJob<Frame<B>>) + Send + 'static>>,
    work_queue: Arc<Mutex<VecDeque<C2DecodeJob<Frame<B>>>>>,
    state: Arc<(Mutex<C2State>, Condvar)>,
    // Set while a drain is outstanding at the engine; jobs stay in the
    // work queue until it completes.
    draining: Arc<AtomicBool>,
}

impl<B> C2DecoderWorker<B>
where
    B: C2DecoderBackend,
{
    /// Hands every runnable job in the work queue to the engine. Stops
    /// at a drain until the engine reports it complete, so the engine
    /// never sees two drains in flight.
    fn pump_work_queue(&mut self) {
        let mut possible_job = self.work_queue.lock().unwrap().pop_front();
        while let Some(mut job) = possible_job {
            if self.draining.load(Ordering::SeqCst) {
                self.work_queue.lock().unwrap().push_front(job);
                break;
            }

            let drain_mode = job.get_drain();
            if !job.input.is_empty() {
                // Protected payloads cannot be inspected.
                if !self.secure {
                    if let Some(aspects) = extract_color_aspects(self.input_codec, &job.input) {
                        *self.bitstream_aspects.lock().unwrap() = Some(aspects);
                    }
                }
                let timestamp = job.timestamp;
                let size = job.input.len();
                let work_done_cb = self.work_done_cb.clone();
                self.decoder.decode(
                    BitstreamBuffer {
                        bitstream_id: timestamp as i32,
                        handle: std::mem::take(&mut job.input),
                        offset: 0,
                        size,
                    },
                    DecodeCb::new(move |status| {
                        // Acknowledge input consumption; the picture for
                        // this timestamp arrives separately, if any.
                        if status == DecodeStatus::Ok {
                            (*work_done_cb.lock().unwrap())(C2DecodeJob {
                                timestamp,
                                ..Default::default()
                            });
                        }
                    }),
                );
            }
            if drain_mode != DrainMode::NoDrain {
                let timestamp = job.timestamp;
                let draining = self.draining.clone();
                draining.store(true, Ordering::SeqCst);
                let work_done_cb = self.work_done_cb.clone();
                self.decoder.drain(DecodeCb::new(move |status| {
                    draining.store(false, Ordering::SeqCst);
                    // Synthetic drains come from the wrapper itself and
                    // must not produce work items.
                    if status == DecodeStatus::Ok && drain_mode == DrainMode::EOSDrain {
                        (*work_done_cb.lock().unwrap())(C2DecodeJob {
                            timestamp,
                            drain: DrainMode::EOSDrain,
                            ..Default::default()
                        });
                    }
                }));
            }

            possible_job = self.work_queue.lock().unwrap().pop_front();
        }
    }
}

impl<B> C2Worker<C2DecodeJob<Frame<B>>> for C2DecoderWorker<B>
where
    B: C2DecoderBackend,
{
    type Options = <B as C2DecoderBackend>::DecoderOptions;

    fn new(
        input_codec: VideoCodec,
        awaiting_job_event: Arc<EventFd>,
        error_cb: Arc<Mutex<dyn FnMut(C2Status) + Send + 'static>>,
        work_done_cb: Arc<Mutex<dyn FnMut(C2DecodeJob<Frame<B>>) + Send + 'static>>,
        work_queue: Arc<Mutex<VecDeque<C2DecodeJob<Frame<B>>>>>,
        state: Arc<(Mutex<C2State>, Condvar)>,
        framepool_hint_cb: Arc<Mutex<dyn FnMut(StreamInfo) + Send + 'static>>,
        alloc_cb: Arc<Mutex<dyn FnMut() -> Option<(Frame<B>, u64)> + Send + 'static>>,
        options: Self::Options,
    ) -> Result<Self, String> {
        let mut backend = B::new(options)?;
        let supported = backend.supported_output_formats(input_codec)?;
        log::info!("supported output formats: {:?}", supported);
        let device = backend.open_device(input_codec)?;

        let get_pool_cb = {
            let framepool_hint_cb = framepool_hint_cb.clone();
            let alloc_cb = alloc_cb.clone();
            Box::new(move |spec: crate::decoder::stateful::PoolSpec<Frame<B>>| {
                (*framepool_hint_cb.lock().unwrap())(StreamInfo {
                    coded_size: spec.coded_size,
                    visible_rect: spec.visible_rect,
                    num_buffers: spec.num_buffers,
                });
                let provider = CallbackFrameProvider { alloc_cb: alloc_cb.clone() };
                Some(Box::new(VideoFramePool::new(
                    provider,
                    spec.num_buffers,
                    spec.epoch,
                    spec.notifier,
                )) as Box<dyn crate::frame_pool::FramePool<Frame<B>>>)
            })
        };

        let bitstream_aspects: Arc<Mutex<Option<ColorAspects>>> = Arc::new(Mutex::new(None));
        let output_cb = {
            let work_done_cb = work_done_cb.clone();
            let bitstream_aspects = bitstream_aspects.clone();
            Box::new(move |frame: crate::decoder::DecodedFrame<Frame<B>>| {
                (*work_done_cb.lock().unwrap())(C2DecodeJob {
                    output: Some(frame.frame),
                    timestamp: frame.bitstream_id as u64,
                    visible_rect: frame.visible_rect,
                    color_aspects: *bitstream_aspects.lock().unwrap(),
                    contains_visible_frame: true,
                    ..Default::default()
                });
            })
        };

        let engine_error_cb = {
            let state = state.clone();
            let error_cb = error_cb.clone();
            Box::new(move || {
                *state.0.lock().unwrap() = C2State::C2Error;
                (*error_cb.lock().unwrap())(C2Status::C2BadValue);
            })
        };

        let secure = backend.is_secure();
        let decoder = StatefulDecoder::new(
            device,
            input_codec,
            INPUT_BUFFER_SIZE,
            min_num_output_buffers(input_codec),
            secure,
            get_pool_cb,
            output_cb,
            engine_error_cb,
        )
        .map_err(|err| format!("failed to create decoder: {}", err))?;

        Ok(Self {
            decoder,
            input_codec,
            secure,
            bitstream_aspects,
            epoll_fd: Epoll::new(EpollCreateFlags::empty())
                .map_err(C2DecoderPollErrorWrapper::Epoll)
                .unwrap(),
            awaiting_job_event,
            work_done_cb,
            work_queue,
            state,
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    fn process_loop(&mut self) {
        self.epoll_fd = Epoll::new(EpollCreateFlags::empty())
            .map_err(C2DecoderPollErrorWrapper::Epoll)
            .unwrap();
        let wake_fd = self.decoder.wake_fd();
        self.epoll_fd
            .add(wake_fd.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .map_err(C2DecoderPollErrorWrapper::EpollAdd)
            .unwrap();
        self.epoll_fd
            .add(self.awaiting_job_event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 2))
            .map_err(C2DecoderPollErrorWrapper::EpollAdd)
            .unwrap();

        while *self.state.0.lock().unwrap() == C2State::C2Running {
            // Poll for engine events or pending job events.
            let mut events = [EpollEvent::empty()];
            let _nb_fds = self.epoll_fd.wait(&mut events, EpollTimeout::NONE).unwrap();

            // Both fds are semaphores; decrement the one that fired.
            if events == [EpollEvent::new(EpollFlags::EPOLLIN, 2)] {
                self.awaiting_job_event.read().unwrap();
            } else if events == [EpollEvent::new(EpollFlags::EPOLLIN, 1)] {
                wake_fd.read().unwrap();
            }

            self.decoder.process_pending_events();

            // Try submitting work regardless of what woke us up: we may
            // have new jobs, or a completed drain may have unblocked the
            // queue.
            self.pump_work_queue();

            self.decoder.process_pending_events();
        }
    }
}
