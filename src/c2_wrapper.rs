// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Component adapter: maps the generic component lifecycle
//! (start/stop/queue/drain/flush) onto a worker thread that owns the
//! decode engine and serializes all access to it.

use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use thiserror::Error;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::vec::Vec;

use crate::bitstream::ColorAspects;
use crate::decoder::StreamInfo;
use crate::Rect;
use crate::VideoCodec;

pub mod c2_decoder;
#[cfg(feature = "v4l2")]
pub mod c2_v4l2_decoder;

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum DrainMode {
    // Not draining
    #[default]
    NoDrain = -1,
    // Drain the component and signal an EOS.
    EOSDrain = 0,
    // Drain the component, but keep accepting new jobs in the queue immediately after.
    NoEOSDrain = 1,
    // Drain signal coming from a drain() or flush() call. These are distinct because we should
    // not return work items for these.
    SyntheticDrain = 2,
}

pub trait Job: Send + 'static {
    type Frame: Send + 'static;

    fn set_drain(&mut self, drain: DrainMode) -> ();
    fn get_drain(&self) -> DrainMode;
}

#[derive(Debug)]
pub struct C2DecodeJob<F: Send + 'static> {
    // Compressed input data.
    pub input: Vec<u8>,
    // Decoded output frame, populated by the worker when the device
    // delivers the picture for this timestamp.
    pub output: Option<F>,
    pub timestamp: u64,
    pub visible_rect: Rect,
    // Most recent color description parsed from the bitstream, attached
    // to frame-bearing items so the output config can track it.
    pub color_aspects: Option<ColorAspects>,
    pub drain: DrainMode,
    // Whether this work item carries actual frame data. The framework
    // expects a work item back for every input regardless, so items
    // acknowledging pure input consumption leave this false.
    pub contains_visible_frame: bool,
}

impl<F: Send + 'static> Job for C2DecodeJob<F> {
    type Frame = F;

    fn set_drain(&mut self, drain: DrainMode) {
        self.drain = drain;
    }

    fn get_drain(&self) -> DrainMode {
        self.drain
    }
}

impl<F: Send + 'static> Default for C2DecodeJob<F> {
    fn default() -> Self {
        Self {
            input: vec![],
            output: None,
            timestamp: 0,
            visible_rect: Rect::default(),
            color_aspects: None,
            drain: DrainMode::NoDrain,
            contains_visible_frame: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum C2State {
    C2Running,
    C2Stopping,
    C2Stopped,
    // Note that on state C2Error, stop() must be called before we can start()
    // again.
    C2Error,
    C2Release,
}

// Numerical values taken from the framework's status codes so the FFI
// layer can pass them through unchanged.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum C2Status {
    C2Ok = 0,
    C2BadState = 1,  // EPERM
    C2BadValue = 22, // EINVAL
}

/// Limits how many components may exist at once and hands out the debug
/// stream ids used to correlate log lines from concurrent instances.
///
/// Injected into component factories; a [`InstanceHandle`] releases its
/// slot on drop.
pub struct InstanceRegistry {
    inner: Arc<Mutex<RegistryState>>,
    max_instances: Option<usize>,
}

struct RegistryState {
    live: usize,
    next_debug_stream_id: u32,
}

pub struct InstanceHandle {
    inner: Arc<Mutex<RegistryState>>,
    debug_stream_id: u32,
}

impl InstanceRegistry {
    /// `max_instances` of `None` means unlimited.
    pub fn new(max_instances: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState { live: 0, next_debug_stream_id: 0 })),
            max_instances,
        }
    }

    /// Claims an instance slot, or `None` when the concurrency cap is
    /// reached.
    pub fn register(&self) -> Option<InstanceHandle> {
        let mut state = self.inner.lock().expect("Could not lock registry");
        if let Some(max) = self.max_instances {
            if state.live >= max {
                log::warn!("rejecting component creation, {} instances already live", state.live);
                return None;
            }
        }
        if state.live == 0 {
            state.next_debug_stream_id = 0;
        }
        let debug_stream_id = state.next_debug_stream_id;
        state.next_debug_stream_id += 1;
        state.live += 1;
        Some(InstanceHandle { inner: self.inner.clone(), debug_stream_id })
    }
}

impl InstanceHandle {
    pub fn debug_stream_id(&self) -> u32 {
        self.debug_stream_id
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.inner.lock().expect("Could not lock registry").live -= 1;
    }
}

// J should be a C2DecodeJob instantiation.
pub trait C2Worker<J>
where
    J: Send + Job + 'static,
{
    type Options: Clone + Send + 'static;

    fn new(
        input_codec: VideoCodec,
        awaiting_job_event: Arc<EventFd>,
        error_cb: Arc<Mutex<dyn FnMut(C2Status) + Send + 'static>>,
        work_done_cb: Arc<Mutex<dyn FnMut(J) + Send + 'static>>,
        work_queue: Arc<Mutex<VecDeque<J>>>,
        state: Arc<(Mutex<C2State>, Condvar)>,
        framepool_hint_cb: Arc<Mutex<dyn FnMut(StreamInfo) + Send + 'static>>,
        alloc_cb: Arc<Mutex<dyn FnMut() -> Option<(<J as Job>::Frame, u64)> + Send + 'static>>,
        options: Self::Options,
    ) -> Result<Self, String>
    where
        Self: Sized;

    fn process_loop(&mut self);
}

#[derive(Debug, Error)]
pub enum C2WrapperError {
    #[error("failed to create EventFd for awaiting job event: {0}")]
    AwaitingJobEventFd(Errno),
}

// Note that we do not guarantee thread safety in C2Wrapper.
pub struct C2Wrapper<J, W>
where
    J: Send + Default + Job + 'static,
    W: C2Worker<J>,
{
    awaiting_job_event: Arc<EventFd>,
    error_cb: Arc<Mutex<dyn FnMut(C2Status) + Send + 'static>>,
    work_queue: Arc<Mutex<VecDeque<J>>>,
    state: Arc<(Mutex<C2State>, Condvar)>,
    // This isn't actually optional, but we want to join this handle in drop(), but because drop()
    // takes an &mut self, we can't actually take ownership of this variable. So we workaround this
    // by just making it an optional and swapping it with None in drop().
    worker_thread: Option<JoinHandle<()>>,
    // Held for its release-on-drop side effect.
    _instance: InstanceHandle,
    // The instance of W actually lives in the thread creation closure, not
    // this struct. We use "fn() -> W" for this type signature instead of just regular "W" as a
    // workaround to make sure this PhantomData doesn't affect the Send and Sync properties of the
    // overall C2Wrapper.
    _phantom: PhantomData<fn() -> W>,
}

impl<J, W> C2Wrapper<J, W>
where
    J: Send + Default + Job + 'static,
    W: C2Worker<J>,
{
    pub fn new(
        input_codec: VideoCodec,
        instance: InstanceHandle,
        error_cb: impl FnMut(C2Status) + Send + 'static,
        work_done_cb: impl FnMut(J) + Send + 'static,
        framepool_hint_cb: impl FnMut(StreamInfo) + Send + 'static,
        alloc_cb: impl FnMut() -> Option<(<J as Job>::Frame, u64)> + Send + 'static,
        options: <W as C2Worker<J>>::Options,
    ) -> Self {
        let debug_stream_id = instance.debug_stream_id();
        let awaiting_job_event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(C2WrapperError::AwaitingJobEventFd)
                .unwrap(),
        );
        let awaiting_job_event_clone = awaiting_job_event.clone();
        let error_cb = Arc::new(Mutex::new(error_cb));
        let error_cb_clone = error_cb.clone();
        let work_done_cb = Arc::new(Mutex::new(work_done_cb));
        let work_queue: Arc<Mutex<VecDeque<J>>> = Arc::new(Mutex::new(VecDeque::new()));
        let work_queue_clone = work_queue.clone();
        let state = Arc::new((Mutex::new(C2State::C2Stopped), Condvar::new()));
        let state_clone = state.clone();
        let framepool_hint_cb = Arc::new(Mutex::new(framepool_hint_cb));
        let alloc_cb = Arc::new(Mutex::new(alloc_cb));
        let worker_thread = Some(thread::spawn(move || {
            let (state_lock, state_cvar) = &*state_clone;
            let mut state = state_lock.lock().expect("Could not lock state");
            while *state != C2State::C2Release {
                if *state == C2State::C2Running {
                    // Otherwise we will just hold the lock during the processing loop, which will
                    // cause a deadlock.
                    drop(state);

                    log::info!("stream {}: starting {} worker", debug_stream_id, input_codec);
                    let worker = W::new(
                        input_codec,
                        awaiting_job_event_clone.clone(),
                        error_cb_clone.clone(),
                        work_done_cb.clone(),
                        work_queue_clone.clone(),
                        state_clone.clone(),
                        framepool_hint_cb.clone(),
                        alloc_cb.clone(),
                        options.clone(),
                    );
                    match worker {
                        Ok(mut worker) => {
                            worker.process_loop();

                            // Note that we only lock the state again after the process loop exits.
                            state = state_lock.lock().expect("Could not lock state");
                            *state = C2State::C2Stopped;
                            state_cvar.notify_one();
                        }
                        Err(msg) => {
                            log::debug!("Error instantiating C2Worker {}", msg);
                            state = state_lock.lock().expect("Could not lock state");
                            *state = C2State::C2Error;
                            state_cvar.notify_one();
                            (*error_cb_clone.lock().unwrap())(C2Status::C2BadValue);
                        }
                    };
                } else {
                    // This is needed to handle the circumstance in which we call reset() after an
                    // error. The state will be C2Error, not C2Running, so we can't rely on the
                    // above logic to process the stop request.
                    if *state == C2State::C2Stopping {
                        *state = C2State::C2Stopped;
                        state_cvar.notify_one();
                    }

                    // It's important that this wait() call goes here, after the check for
                    // C2Running. Otherwise the call to start() might be executed before we fully
                    // initialize this thread. Because notify_one() doesn't do any kind of
                    // buffering, we can miss our "wake-up call" and just wait indefinitely.
                    state = state_cvar.wait(state).unwrap();
                }
            }
        }));

        Self {
            awaiting_job_event,
            error_cb,
            work_queue,
            state,
            worker_thread,
            _instance: instance,
            _phantom: Default::default(),
        }
    }

    // Start the decoder.
    // State will be C2Running after this call.
    pub fn start(&mut self) -> C2Status {
        let (state_lock, state_cvar) = &*self.state;
        {
            let mut state = state_lock.lock().expect("Could not lock state");
            if *state != C2State::C2Stopped {
                (*self.error_cb.lock().unwrap())(C2Status::C2BadState);
                return C2Status::C2BadState;
            }
            *state = C2State::C2Running;
            state_cvar.notify_one();
        }

        C2Status::C2Ok
    }

    // Helper method for stop() and reset() to re-use code: if `is_reset` is
    // true, no state validation is performed (suitable for reset()), otherwise
    // we validate that we're in the C2Running state (suitable for stop()). This
    // is necessary to abide by the component API.
    fn stop_internal(&mut self, is_reset: bool) -> C2Status {
        let (state_lock, state_cvar) = &*self.state;
        {
            let mut state = state_lock.lock().expect("Could not lock state");
            if !is_reset && *state != C2State::C2Running {
                (*self.error_cb.lock().unwrap())(C2Status::C2BadState);
                return C2Status::C2BadState;
            }
            *state = C2State::C2Stopping;
            state_cvar.notify_one();
        }

        self.work_queue.lock().unwrap().drain(..);

        self.awaiting_job_event.write(1).unwrap();

        let mut state = state_lock.lock().expect("Could not lock state");
        while *state == C2State::C2Stopping {
            state = state_cvar.wait(state).unwrap();
        }

        C2Status::C2Ok
    }

    // Stop the decoder and abandon in-flight work.
    // Note that in event of error, stop() must be called before we can start()
    // again. This is to ensure we clear out the work queue.
    // State will be C2Stopped after this call.
    pub fn stop(&mut self) -> C2Status {
        self.stop_internal(/*is_reset=*/ false)
    }

    // Reset the decoder and abandon in-flight work.
    // For our purposes, this is equivalent to stop() except for the fact that
    // this method doesn't fail if the state is already C2Stopped.
    // State will be C2Stopped after this call.
    pub fn reset(&mut self) -> C2Status {
        self.stop_internal(/*is_reset=*/ true)
    }

    // Add work to the work queue.
    // State must be C2Running or this function is invalid.
    // State will remain C2Running.
    pub fn queue(&mut self, work_items: Vec<J>) -> C2Status {
        if *self.state.0.lock().expect("Could not lock state") != C2State::C2Running {
            (*self.error_cb.lock().unwrap())(C2Status::C2BadState);
            return C2Status::C2BadState;
        }

        self.work_queue.lock().unwrap().extend(work_items.into_iter());

        self.awaiting_job_event.write(1).unwrap();

        C2Status::C2Ok
    }

    // Flush work from the queue and return it as |flushed_work|.
    // State will not change after this call.
    pub fn flush(&mut self, flushed_work: &mut Vec<J>) -> C2Status {
        if *self.state.0.lock().expect("Could not lock state") != C2State::C2Running {
            (*self.error_cb.lock().unwrap())(C2Status::C2BadState);
            return C2Status::C2BadState;
        }

        {
            let mut work_queue = self.work_queue.lock().unwrap();
            let mut tmp = work_queue.drain(..).collect::<Vec<J>>();
            flushed_work.append(&mut tmp);

            // Note that we don't just call drain() because we want to guarantee atomicity with
            // respect to the work_queue eviction.
            let mut drain_job: J = Default::default();
            drain_job.set_drain(DrainMode::SyntheticDrain);
            work_queue.push_back(drain_job);
        }

        self.awaiting_job_event.write(1).unwrap();

        C2Status::C2Ok
    }

    // Signal to the decoder that it does not need to wait for additional
    // work to begin processing. This is an unusual name for this function,
    // but it is the convention the framework uses.
    // State must be C2Running or this function is invalid.
    // State will remain C2Running after the drain is complete.
    pub fn drain(&mut self, _mode: DrainMode) -> C2Status {
        if *self.state.0.lock().expect("Could not lock state") != C2State::C2Running {
            (*self.error_cb.lock().unwrap())(C2Status::C2BadState);
            return C2Status::C2BadState;
        }

        let mut drain_job: J = Default::default();
        drain_job.set_drain(DrainMode::SyntheticDrain);
        self.work_queue.lock().unwrap().push_back(drain_job);

        self.awaiting_job_event.write(1).unwrap();

        C2Status::C2Ok
    }
}

// Instead of the framework's release() function, we implement Drop and use
// RAII to accomplish the same thing.
impl<J, W> Drop for C2Wrapper<J, W>
where
    J: Send + Default + Job + 'static,
    W: C2Worker<J>,
{
    fn drop(&mut self) {
        // Note: we call reset() instead of stop() so that if we're already
        // C2Stopped, we don't trigger a call to the error callback.
        self.reset();

        let (state_lock, state_cvar) = &*self.state;
        *state_lock.lock().expect("Could not lock state") = C2State::C2Release;
        state_cvar.notify_one();
        let _ = self.worker_thread.take().unwrap().join();
    }
}
