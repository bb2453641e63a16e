// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Polling thread for a decode device.
//!
//! The device fd is polled for out-of-band events continuously, but for
//! ready buffers only after [`DevicePoller::schedule`] arms a poll. The
//! device wrapper arms one whenever it queues or dequeues a buffer, so
//! the thread blocks instead of spinning while the engine has nothing
//! queued.

use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::device::DeviceError;
use crate::device::ServiceNotifier;

struct PollerState {
    /// Wakes the poll thread to re-evaluate `stop` and `poll_buffers`.
    interrupt: EventFd,
    stop: AtomicBool,
    /// Armed when the next poll should also watch for ready buffers.
    poll_buffers: AtomicBool,
}

pub struct DevicePoller {
    state: Arc<PollerState>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DevicePoller {
    /// Spawns the poll thread on `fd`, reporting wake-ups to `notifier`.
    pub fn start<F>(fd: Arc<F>, notifier: Box<dyn ServiceNotifier>) -> Result<Self, DeviceError>
    where
        F: AsFd + Send + Sync + 'static,
    {
        let interrupt = EventFd::from_flags(EfdFlags::EFD_NONBLOCK)
            .map_err(|err| DeviceError::Poller(format!("failed to create interrupt fd: {}", err)))?;
        let state = Arc::new(PollerState {
            interrupt,
            stop: AtomicBool::new(false),
            poll_buffers: AtomicBool::new(false),
        });
        let state_clone = state.clone();
        let thread = thread::Builder::new()
            .name("device poller".into())
            .spawn(move || poll_loop(fd, state_clone, notifier))
            .map_err(|err| DeviceError::Poller(format!("failed to spawn poll thread: {}", err)))?;
        Ok(Self { state, thread: Some(thread) })
    }

    /// Arms buffer polling for the next poll iteration.
    pub fn schedule(&self) {
        if !self.state.poll_buffers.swap(true, Ordering::SeqCst) {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(err) = self.state.interrupt.write(1) {
            log::error!("failed to interrupt device poll: {}", err);
        }
    }

    /// Stops and joins the poll thread.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.state.stop.store(true, Ordering::SeqCst);
        self.wake();
        if thread.join().is_err() {
            log::error!("device poll thread panicked");
        }
    }
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn poll_loop<F: AsFd>(fd: Arc<F>, state: Arc<PollerState>, notifier: Box<dyn ServiceNotifier>) {
    loop {
        if state.stop.load(Ordering::SeqCst) {
            log::debug!("poll stopped, exiting");
            return;
        }

        let poll_buffers = state.poll_buffers.swap(false, Ordering::SeqCst);
        let mut device_flags = PollFlags::POLLPRI;
        if poll_buffers {
            device_flags |= PollFlags::POLLIN;
        }
        let mut fds = [
            PollFd::new(fd.as_fd(), device_flags),
            PollFd::new(state.interrupt.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                // Poll again with buffer polling still armed.
                if poll_buffers {
                    state.poll_buffers.store(true, Ordering::SeqCst);
                }
                continue;
            }
            Err(err) => {
                log::error!("failed to poll device: {}", err);
                notifier.notify_poll_error(DeviceError::Poller(err.to_string()));
                return;
            }
        }

        let device_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let interrupted = fds[1]
            .revents()
            .map_or(false, |revents| revents.contains(PollFlags::POLLIN));
        // The counter is not a semaphore; one read clears all pending
        // interrupts.
        if interrupted {
            let _ = state.interrupt.read();
        }

        let has_event = device_revents.contains(PollFlags::POLLPRI);
        let buffers_pending = device_revents.contains(PollFlags::POLLIN);

        // Buffer polling was requested but nothing was ready yet; keep it
        // armed so the request is not lost.
        if poll_buffers && !buffers_pending {
            state.poll_buffers.store(true, Ordering::SeqCst);
        }

        if has_event || buffers_pending {
            notifier.notify_service_needed(has_event);
        }
    }
}
