use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use crate::codec::{EncodedChunk, StreamDecoder};
use crate::config::PlaybackConfig;

/// Jitter buffer for the response audio path.
///
/// Chunks accumulate until the buffering threshold is met, then decode into
/// one growing sample buffer consumed by the pull-based reader. The write
/// side (decode) and read side (output callback) share one short-lived lock;
/// the read path is allocation-free.
pub struct PlaybackBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    cfg: PlaybackConfig,
    decoder: Box<dyn StreamDecoder>,

    pending: VecDeque<EncodedChunk>,
    pending_bytes: usize,
    /// Threshold crossed; decoding is now incremental.
    started: bool,

    decoded: Vec<f32>,
    read_cursor: usize,
    total_decoded: usize,
    /// Silence samples handed to the output while starved, for latency
    /// accounting.
    silence_filled: usize,

    end_of_stream: bool,
    /// When the cursor first caught up to the decoded length after
    /// end-of-stream.
    caught_up_at: Option<Instant>,
}

impl Inner {
    fn threshold(&self) -> usize {
        self.cfg.base_threshold * self.cfg.buffering_level.max(1)
    }

    fn decode_one(&mut self, chunk: &[u8]) {
        match self.decoder.decode_chunk(chunk) {
            Ok(samples) => {
                self.total_decoded += samples.len();
                self.decoded.extend_from_slice(&samples);
            }
            Err(e) => {
                // One bad chunk must not abort playback.
                warn!("chunk decode failed, skipping: {}", e);
            }
        }
    }

    fn decode_all_pending(&mut self) {
        while let Some(chunk) = self.pending.pop_front() {
            self.pending_bytes -= chunk.len();
            self.decode_one(&chunk);
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.started = false;
        self.decoded.clear();
        self.read_cursor = 0;
        self.total_decoded = 0;
        self.silence_filled = 0;
        self.end_of_stream = false;
        self.caught_up_at = None;
        self.decoder.reset();
    }
}

impl PlaybackBuffer {
    pub fn new(cfg: PlaybackConfig, decoder: Box<dyn StreamDecoder>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cfg,
                decoder,
                pending: VecDeque::new(),
                pending_bytes: 0,
                started: false,
                decoded: Vec::new(),
                read_cursor: 0,
                total_decoded: 0,
                silence_filled: 0,
                end_of_stream: false,
                caught_up_at: None,
            }),
        }
    }

    /// Append one compressed chunk. Returns true exactly once per response:
    /// when the buffering threshold is first crossed and playback should
    /// start.
    ///
    /// The first crossing decodes every buffered chunk at once, not just the
    /// triggering one; chunks that arrived before the threshold was met must
    /// not be left behind as an audible gap.
    pub fn push_chunk(&self, chunk: EncodedChunk) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };

        if inner.started {
            inner.decode_one(&chunk);
            return false;
        }

        inner.pending_bytes += chunk.len();
        inner.pending.push_back(chunk);

        if inner.pending_bytes >= inner.threshold() {
            debug!(
                "buffering threshold met ({} bytes), starting playback",
                inner.pending_bytes
            );
            inner.decode_all_pending();
            inner.started = true;
            return true;
        }

        false
    }

    /// The response is complete on the wire. Any chunks still below the
    /// threshold are decoded now so short responses play at all.
    pub fn mark_end_of_stream(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if !inner.pending.is_empty() {
                inner.decode_all_pending();
                inner.started = true;
            }
            inner.end_of_stream = true;
        }
    }

    /// Pull decoded samples into the host's output buffer. Copies what
    /// exists from the cursor and zero-fills the remainder, counting filled
    /// silence. Returns the number of real samples copied.
    ///
    /// Runs on the host's audio path: bounded, no allocation.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => {
                out.fill(0.0);
                return 0;
            }
        };

        let available = inner.decoded.len() - inner.read_cursor;
        let copied = available.min(out.len());
        let start = inner.read_cursor;
        out[..copied].copy_from_slice(&inner.decoded[start..start + copied]);
        out[copied..].fill(0.0);

        inner.read_cursor += copied;
        inner.silence_filled += out.len() - copied;
        copied
    }

    /// Fully rendered: end-of-stream was signaled, the cursor has caught up
    /// to everything decoded, and the output-latency grace period has
    /// elapsed since it caught up (the device is still rendering the tail
    /// when the cursor arrives).
    pub fn is_drained(&self) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return true,
        };

        if !inner.end_of_stream || !inner.pending.is_empty() {
            return false;
        }
        if inner.read_cursor < inner.decoded.len() {
            inner.caught_up_at = None;
            return false;
        }

        let caught_up = *inner.caught_up_at.get_or_insert_with(Instant::now);
        caught_up.elapsed() >= inner.cfg.output_latency
    }

    /// Reset every field to initial state. Safe at any time, including
    /// between a push and its decode; calling it twice is the same as once.
    pub fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reset();
        }
    }

    // Accessors used by the driver and tests.

    pub fn has_started(&self) -> bool {
        self.inner.lock().map(|i| i.started).unwrap_or(false)
    }

    pub fn decoded_len(&self) -> usize {
        self.inner.lock().map(|i| i.decoded.len()).unwrap_or(0)
    }

    pub fn read_cursor(&self) -> usize {
        self.inner.lock().map(|i| i.read_cursor).unwrap_or(0)
    }

    pub fn total_decoded(&self) -> usize {
        self.inner.lock().map(|i| i.total_decoded).unwrap_or(0)
    }

    pub fn silence_filled(&self) -> usize {
        self.inner.lock().map(|i| i.silence_filled).unwrap_or(0)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.inner.lock().map(|i| i.end_of_stream).unwrap_or(false)
    }

    pub fn pending_bytes(&self) -> usize {
        self.inner.lock().map(|i| i.pending_bytes).unwrap_or(0)
    }
}
