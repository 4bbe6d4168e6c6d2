use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::frame::AudioFrame;
use crate::audio::resample::resample_linear;
use crate::codec::{EncodedChunk, StreamEncoder};

use super::capture::CaptureEvent;

// Idle poll interval. Short enough that cancellation and graceful stop are
// observed well inside one frame's worth of audio.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Background worker draining the raw-frame queue into the streaming
/// encoder and pushing ready pages onto the chunk queue.
///
/// At most one worker runs per session: `is_running()` reflects true worker
/// liveness (the flag is raised before spawn under the session's serialized
/// transitions and cleared by the worker on every exit path), so a second
/// `start` observes the live worker and reuses it instead of duplicating.
pub struct EncodeBridge {
    raw_queue: Arc<Mutex<VecDeque<AudioFrame>>>,
    chunk_queue: Arc<Mutex<VecDeque<EncodedChunk>>>,
    events: mpsc::UnboundedSender<CaptureEvent>,

    running: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
    graceful_stop: Arc<AtomicBool>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl EncodeBridge {
    pub fn new(
        raw_queue: Arc<Mutex<VecDeque<AudioFrame>>>,
        chunk_queue: Arc<Mutex<VecDeque<EncodedChunk>>>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            raw_queue,
            chunk_queue,
            events,
            running: Arc::new(AtomicBool::new(false)),
            faulted: Arc::new(AtomicBool::new(false)),
            graceful_stop: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    /// True while the worker is alive: not completed, not faulted, not
    /// canceled-and-exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The last worker exited on an encoder fault. Cleared by `start` and
    /// `clear_fault`.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Forget a previous fault. A fresh recording gets a fresh chance.
    pub fn clear_fault(&self) {
        self.faulted.store(false, Ordering::Release);
    }

    /// Withdraw a pending graceful stop so a live worker can be reused for
    /// a rapid back-to-back utterance.
    pub fn cancel_graceful_stop(&self) {
        self.graceful_stop.store(false, Ordering::Release);
    }

    /// Spawn the worker unless one is already live. Returns whether a new
    /// worker was spawned.
    pub fn start(&mut self, encoder: Box<dyn StreamEncoder>) -> bool {
        if self.is_running() {
            debug!("encode worker already live, reusing");
            return false;
        }

        // Reap the previous worker's handle, if any.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.graceful_stop.store(false, Ordering::Release);
        self.faulted.store(false, Ordering::Release);
        self.cancel = CancellationToken::new();
        self.running.store(true, Ordering::Release);

        let raw = self.raw_queue.clone();
        let chunks = self.chunk_queue.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let faulted = self.faulted.clone();
        let graceful = self.graceful_stop.clone();
        let cancel = self.cancel.clone();

        self.worker = Some(std::thread::spawn(move || {
            let clean = run_worker(encoder, raw, chunks, events, graceful, cancel);
            if !clean {
                faulted.store(true, Ordering::Release);
            }
            running.store(false, Ordering::Release);
        }));

        true
    }

    /// Ask the worker to drain the raw queue to completion, flush, and exit.
    pub fn request_graceful_stop(&self) {
        self.graceful_stop.store(true, Ordering::Release);
    }

    /// Cancel the worker. It still performs one final forced flush before
    /// exiting, so no tail audio is silently dropped, but queued frames are
    /// abandoned.
    pub fn force_stop(&self) {
        self.cancel.cancel();
    }

    /// Block until the current worker has exited. Test/teardown helper.
    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Returns false if the worker exited on an encoder fault.
fn run_worker(
    mut encoder: Box<dyn StreamEncoder>,
    raw: Arc<Mutex<VecDeque<AudioFrame>>>,
    chunks: Arc<Mutex<VecDeque<EncodedChunk>>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    graceful: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> bool {
    let target_rate = encoder.sample_rate();
    debug!("encode worker started, target {}Hz", target_rate);

    loop {
        // Cancellation is checked once per iteration; the final flush below
        // is the contract that lets the transport layer trust "drained".
        if cancel.is_cancelled() {
            let clean = flush_remaining(&mut *encoder, &chunks, &events);
            debug!("encode worker canceled");
            return clean;
        }

        let frame = match raw.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => {
                warn!("raw frame queue poisoned, stopping encoder");
                let _ = events.send(CaptureEvent::EncoderFailed {
                    reason: "raw frame queue poisoned".to_string(),
                });
                return false;
            }
        };

        match frame {
            Some(frame) => {
                let samples = resample_linear(frame.samples(), frame.sample_rate(), target_rate);
                let fed = encoder
                    .feed(&samples)
                    .and_then(|_| encoder.drain_pages());
                match fed {
                    Ok(pages) => push_pages(&chunks, pages),
                    Err(e) => {
                        // Encoder faults are fatal to this worker and must
                        // surface; the transport side is waiting on a known
                        // "no more data" condition.
                        warn!("encoder failed: {}", e);
                        let _ = events.send(CaptureEvent::EncoderFailed {
                            reason: e.to_string(),
                        });
                        return false;
                    }
                }
            }
            None => {
                if graceful.load(Ordering::Acquire) {
                    let clean = flush_remaining(&mut *encoder, &chunks, &events);
                    debug!("encode worker drained and stopped");
                    return clean;
                }
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

fn flush_remaining(
    encoder: &mut dyn StreamEncoder,
    chunks: &Arc<Mutex<VecDeque<EncodedChunk>>>,
    events: &mpsc::UnboundedSender<CaptureEvent>,
) -> bool {
    match encoder.flush() {
        Ok(pages) => {
            push_pages(chunks, pages);
            true
        }
        Err(e) => {
            warn!("final encoder flush failed: {}", e);
            let _ = events.send(CaptureEvent::EncoderFailed {
                reason: e.to_string(),
            });
            false
        }
    }
}

fn push_pages(chunks: &Arc<Mutex<VecDeque<EncodedChunk>>>, pages: Vec<EncodedChunk>) {
    if pages.is_empty() {
        return;
    }
    if let Ok(mut q) = chunks.lock() {
        for page in pages {
            q.push_back(page);
        }
    }
}
