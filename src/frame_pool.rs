// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous output picture-buffer pool.
//!
//! Fetching a buffer from the external allocator can block or time out,
//! so it runs on a dedicated thread. The engine issues at most one fetch
//! at a time and receives results through its event channel, tagged with
//! the pool's epoch so a fetch completed against an already-replaced pool
//! is recognized as stale and discarded.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::decoder::EngineEvent;
use crate::decoder::EngineNotifier;

/// One attempt at acquiring a picture buffer from the external allocator.
pub enum FetchOutcome<F> {
    Ready { frame: F, block_id: u64 },
    /// The allocator is momentarily out of free buffers.
    TryAgain,
    /// The allocator failed terminally.
    Fatal,
}

/// Synchronous buffer source driven by the pool's fetch thread.
pub trait FrameProvider: Send + 'static {
    type Frame: Send + 'static;

    fn fetch(&mut self) -> FetchOutcome<Self::Frame>;
}

/// Engine-facing pool interface. Results arrive asynchronously as
/// [`EngineEvent::FrameReady`] messages.
pub trait FramePool<F>: Send {
    /// Starts a fetch. Returns `false` if one is already outstanding.
    fn fetch(&mut self) -> bool;
}

/// Pool backed by a fetch thread with exponential-backoff retry.
pub struct VideoFramePool {
    fetch_tx: Option<mpsc::Sender<()>>,
    fetch_thread: Option<thread::JoinHandle<()>>,
    outstanding: Arc<AtomicBool>,
}

const FETCH_RETRY_DELAY_INIT: Duration = Duration::from_micros(256);
// One frame interval at 60fps.
const FETCH_RETRY_DELAY_MAX: Duration = Duration::from_micros(16384);

impl VideoFramePool {
    /// `max_buffer_count` bounds how many distinct block ids the pool
    /// will hand out; the allocator over-provisioning past that count is
    /// absorbed here by dropping the extra buffers. `epoch` tags every
    /// result posted to `notifier`.
    pub fn new<P>(
        mut provider: P,
        max_buffer_count: usize,
        epoch: u64,
        notifier: EngineNotifier<P::Frame>,
    ) -> Self
    where
        P: FrameProvider,
    {
        let (fetch_tx, fetch_rx) = mpsc::channel::<()>();
        let outstanding = Arc::new(AtomicBool::new(false));
        let outstanding_clone = outstanding.clone();
        let fetch_thread = thread::Builder::new()
            .name("frame pool fetch".into())
            .spawn(move || {
                let mut seen_blocks = HashSet::new();
                while fetch_rx.recv().is_ok() {
                    let result = fetch_with_retry(
                        &mut provider,
                        &mut seen_blocks,
                        max_buffer_count,
                    );
                    outstanding_clone.store(false, Ordering::SeqCst);
                    notifier.post(EngineEvent::FrameReady { epoch, result });
                }
            })
            .expect("failed to spawn frame pool fetch thread");
        Self { fetch_tx: Some(fetch_tx), fetch_thread: Some(fetch_thread), outstanding }
    }
}

fn fetch_with_retry<P: FrameProvider>(
    provider: &mut P,
    seen_blocks: &mut HashSet<u64>,
    max_buffer_count: usize,
) -> Option<(P::Frame, u64)> {
    let mut delay = FETCH_RETRY_DELAY_INIT;
    loop {
        match provider.fetch() {
            FetchOutcome::Ready { frame, block_id } => {
                // An unseen block past the target count means the
                // allocator handed out more buffers than requested.
                // Returning it would overflow the device queue slots, so
                // release it and try again.
                if seen_blocks.len() >= max_buffer_count && !seen_blocks.contains(&block_id) {
                    log::debug!("dropping over-provisioned buffer with block id {}", block_id);
                    drop(frame);
                } else {
                    seen_blocks.insert(block_id);
                    return Some((frame, block_id));
                }
            }
            FetchOutcome::TryAgain => {}
            FetchOutcome::Fatal => return None,
        }
        thread::sleep(delay);
        delay = next_retry_delay(delay);
    }
}

/// Doubles the retry delay up to [`FETCH_RETRY_DELAY_MAX`].
fn next_retry_delay(delay: Duration) -> Duration {
    (delay * 2).min(FETCH_RETRY_DELAY_MAX)
}

impl<F: Send + 'static> FramePool<F> for VideoFramePool {
    fn fetch(&mut self) -> bool {
        if self.outstanding.swap(true, Ordering::SeqCst) {
            return false;
        }
        match &self.fetch_tx {
            Some(tx) if tx.send(()).is_ok() => true,
            _ => {
                self.outstanding.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

impl Drop for VideoFramePool {
    fn drop(&mut self) {
        // Closing the channel ends the fetch loop.
        self.fetch_tx.take();
        if let Some(thread) = self.fetch_thread.take() {
            if thread.join().is_err() {
                log::error!("frame pool fetch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider yielding a scripted sequence of outcomes.
    struct ScriptedProvider {
        script: Arc<Mutex<VecDeque<FetchOutcome<u32>>>>,
    }

    impl FrameProvider for ScriptedProvider {
        type Frame = u32;

        fn fetch(&mut self) -> FetchOutcome<u32> {
            self.script.lock().unwrap().pop_front().unwrap_or(FetchOutcome::Fatal)
        }
    }

    fn scripted_pool(
        script: Vec<FetchOutcome<u32>>,
        max_buffer_count: usize,
    ) -> (VideoFramePool, mpsc::Receiver<EngineEvent<u32>>) {
        let (notifier, receiver) = EngineNotifier::channel().unwrap();
        let provider =
            ScriptedProvider { script: Arc::new(Mutex::new(VecDeque::from(script))) };
        (VideoFramePool::new(provider, max_buffer_count, 7, notifier), receiver)
    }

    fn expect_frame(receiver: &mpsc::Receiver<EngineEvent<u32>>) -> Option<(u32, u64)> {
        match receiver.recv_timeout(Duration::from_secs(5)).expect("no fetch result") {
            EngineEvent::FrameReady { epoch, result } => {
                assert_eq!(epoch, 7);
                result
            }
            _ => panic!("unexpected engine event"),
        }
    }

    #[test]
    fn fetch_delivers_frame() {
        let (mut pool, receiver) =
            scripted_pool(vec![FetchOutcome::Ready { frame: 42, block_id: 1 }], 4);
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert_eq!(expect_frame(&receiver), Some((42, 1)));
    }

    #[test]
    fn retries_until_ready() {
        let (mut pool, receiver) = scripted_pool(
            vec![
                FetchOutcome::TryAgain,
                FetchOutcome::TryAgain,
                FetchOutcome::Ready { frame: 9, block_id: 3 },
            ],
            4,
        );
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert_eq!(expect_frame(&receiver), Some((9, 3)));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let mut delay = FETCH_RETRY_DELAY_INIT;
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(delay.as_micros());
            delay = next_retry_delay(delay);
        }
        assert_eq!(observed, vec![256, 512, 1024, 2048, 4096, 8192, 16384, 16384]);
        assert_eq!(delay, FETCH_RETRY_DELAY_MAX);
    }

    #[test]
    fn over_provisioned_block_is_dropped() {
        let (mut pool, receiver) = scripted_pool(
            vec![
                FetchOutcome::Ready { frame: 1, block_id: 10 },
                // Block 11 exceeds the one-buffer budget and must not be
                // handed to the engine.
                FetchOutcome::Ready { frame: 2, block_id: 11 },
                FetchOutcome::Ready { frame: 3, block_id: 10 },
            ],
            1,
        );
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert_eq!(expect_frame(&receiver), Some((1, 10)));
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert_eq!(expect_frame(&receiver), Some((3, 10)));
    }

    #[test]
    fn allocator_failure_reported() {
        let (mut pool, receiver) = scripted_pool(vec![FetchOutcome::Fatal], 4);
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert_eq!(expect_frame(&receiver), None);
    }

    #[test]
    fn second_fetch_while_outstanding_is_rejected() {
        let (notifier, receiver) = EngineNotifier::channel().unwrap();
        // A provider that never completes, keeping the fetch outstanding.
        struct Stuck;
        impl FrameProvider for Stuck {
            type Frame = u32;
            fn fetch(&mut self) -> FetchOutcome<u32> {
                FetchOutcome::TryAgain
            }
        }
        let mut pool = VideoFramePool::new(Stuck, 4, 0, notifier);
        assert!(FramePool::<u32>::fetch(&mut pool));
        assert!(!FramePool::<u32>::fetch(&mut pool));
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        // Leak the pool; dropping it would join the stuck fetch thread.
        std::mem::forget(pool);
    }
}
