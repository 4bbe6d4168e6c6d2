use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::frame::{AudioFrame, SlidingWindow};
use crate::audio::wav;
use crate::codec::{EncodedChunk, EncoderFactory};
use crate::config::CaptureConfig;
use crate::error::VoiceResult;
use crate::vad::{SpeechActivityDetector, SpeechSegment, VadEvent};

use super::encode::EncodeBridge;

/// One recording's lifecycle. `Idle` is both initial and re-entrant via
/// `start_recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    WaitingForSpeech,
    Recording,
    Finished,
    TooLong,
    Interrupted,
}

/// Capture-side events consumed by the conversation driver.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Speech started (detector opened a segment).
    Spoke,
    /// Speech ended (detector closed a segment).
    Silenced,
    /// No speech arrived within the wait budget.
    SilenceTimeout,
    /// The recording hit the hard duration cap.
    TooLong,
    /// The encode worker died; the chunk queue is finished.
    EncoderFailed { reason: String },
}

/// Owns one recording: raw-sample history, the two session FIFOs, the
/// sliding window feeding the detector, guard timers, and the encode
/// bridge. State transitions are serialized by the owner's lock; the
/// ingestion thread is the only frame writer.
pub struct CaptureSession {
    cfg: CaptureConfig,
    state: CaptureState,

    detector: SpeechActivityDetector,
    window: SlidingWindow,

    /// Full session history, append-only while recording. Backs the
    /// "here is what you said" export.
    raw_log: Vec<f32>,
    raw_queue: Arc<Mutex<VecDeque<AudioFrame>>>,
    chunk_queue: Arc<Mutex<VecDeque<EncodedChunk>>>,

    bridge: EncodeBridge,
    encoder_factory: EncoderFactory,
    events: mpsc::UnboundedSender<CaptureEvent>,

    started_at: Option<Instant>,
    recording_since: Option<Instant>,

    /// Padded, merged segments of the last finished recording.
    last_segments: Vec<SpeechSegment>,
}

impl CaptureSession {
    pub fn new(
        cfg: CaptureConfig,
        detector: SpeechActivityDetector,
        encoder_factory: EncoderFactory,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let raw_queue = Arc::new(Mutex::new(VecDeque::new()));
        let chunk_queue = Arc::new(Mutex::new(VecDeque::new()));
        let bridge = EncodeBridge::new(raw_queue.clone(), chunk_queue.clone(), events.clone());
        let window_size = detector.config().window_size;

        Self {
            cfg,
            state: CaptureState::Idle,
            detector,
            window: SlidingWindow::new(window_size),
            raw_log: Vec::new(),
            raw_queue,
            chunk_queue,
            bridge,
            encoder_factory,
            events,
            started_at: None,
            recording_since: None,
            last_segments: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.cfg
    }

    pub fn set_keep_open_on_silence(&mut self, keep_open: bool) {
        self.cfg.keep_open_on_silence = keep_open;
    }

    /// Whether the session is currently consuming microphone frames.
    pub fn is_capturing(&self) -> bool {
        matches!(
            self.state,
            CaptureState::WaitingForSpeech | CaptureState::Recording
        )
    }

    pub fn encoder_running(&self) -> bool {
        self.bridge.is_running()
    }

    /// Drain every encoded chunk currently queued, in FIFO order.
    pub fn drain_encoded(&self) -> Vec<EncodedChunk> {
        match self.chunk_queue.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn encoded_backlog_empty(&self) -> bool {
        self.chunk_queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    /// The raw queue is fully consumed and the encoder has exited: nothing
    /// more will appear on the chunk queue.
    pub fn encoder_drained(&self) -> bool {
        !self.bridge.is_running()
            && self.raw_queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    pub fn raw_log(&self) -> &[f32] {
        &self.raw_log
    }

    /// Speech segments of the last finished recording, padded outward and
    /// merged. Sample coordinates index into `raw_log`.
    pub fn speech_segments(&self) -> &[SpeechSegment] {
        &self.last_segments
    }

    /// Begin a fresh recording: all buffers and queues cleared, wall clock
    /// armed, state -> WaitingForSpeech.
    pub fn start_recording(&mut self) {
        self.raw_log.clear();
        self.window.clear();
        self.detector.reset();
        self.clear_queues();
        self.bridge.clear_fault();
        self.last_segments.clear();

        self.state = CaptureState::WaitingForSpeech;
        self.started_at = Some(Instant::now());
        self.recording_since = None;
        info!("recording started, waiting for speech");
    }

    /// Stop the recording and begin graceful encoder shutdown. Remaining
    /// queued frames are still encoded and flushed.
    pub fn stop_recording(&mut self) {
        // Score the zero-padded trailing window, then close any still-open
        // segment so an utterance cut off by the stop is not lost.
        if self.is_capturing() {
            if let Some(window) = self.window.take_padded() {
                for event in self.detector.process_window(&window) {
                    self.handle_vad_event(event);
                }
            }
            for event in self.detector.finish() {
                if let VadEvent::SpeechEnd { .. } = event {
                    let _ = self.events.send(CaptureEvent::Silenced);
                }
            }
        }
        self.last_segments = self.detector.padded_segments();

        self.window.clear();
        self.detector.reset();
        self.bridge.request_graceful_stop();
        self.state = CaptureState::Finished;
        info!("recording stopped");
    }

    /// Abandon the current utterance: all buffered raw and encoded audio is
    /// discarded immediately, no graceful drain.
    pub fn interrupt(&mut self) {
        self.clear_queues();
        self.bridge.force_stop();
        self.window.clear();
        self.detector.reset();
        self.state = CaptureState::Interrupted;
        info!("recording interrupted");
    }

    /// Ingest one microphone frame. Called from the capture ingestion
    /// thread only; frames arriving while the session is not capturing are
    /// dropped.
    pub fn ingest_frame(&mut self, frame: AudioFrame) {
        if !self.is_capturing() {
            return;
        }

        self.raw_log.extend_from_slice(frame.samples());
        self.window.extend(frame.samples());
        if let Ok(mut q) = self.raw_queue.lock() {
            q.push_back(frame);
        }

        while let Some(window) = self.window.next_window() {
            if !self.check_guards() {
                return;
            }
            // A worker that exited cleanly between utterances is replaced;
            // a faulted one is not retried for this recording.
            if self.state == CaptureState::Recording && !self.bridge.is_running() {
                self.ensure_encoder();
            }
            let events = self.detector.process_window(&window);
            for event in events {
                self.handle_vad_event(event);
                if !self.is_capturing() {
                    return;
                }
            }
        }
    }

    /// Guard timers, checked once per buffered-window cycle. Returns false
    /// if the session was force-stopped.
    fn check_guards(&mut self) -> bool {
        match self.state {
            CaptureState::Recording => {
                let elapsed = self
                    .recording_since
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed > self.cfg.max_speech_duration {
                    self.force_stop_too_long();
                    return false;
                }
            }
            CaptureState::WaitingForSpeech => {
                let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > self.cfg.max_wait_for_speech {
                    info!("no speech within wait budget, force-stopping");
                    self.bridge.force_stop();
                    self.state = CaptureState::Finished;
                    let _ = self.events.send(CaptureEvent::SilenceTimeout);
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    fn handle_vad_event(&mut self, event: VadEvent) {
        match event {
            VadEvent::Probability { .. } => {}
            VadEvent::SpeechStart { position } => self.on_speech_started(position),
            VadEvent::SpeechEnd { .. } => self.on_speech_ended(),
            VadEvent::SpeechTooLong { .. } => {
                debug!("detector hit the speech duration cap");
                self.force_stop_too_long();
            }
        }
    }

    fn on_speech_started(&mut self, position: usize) {
        debug!("speech started at sample {}", position);

        // Long idle periods leave a deep pre-speech backlog; only the most
        // recent second is worth encoding.
        self.trim_backlog();
        self.ensure_encoder();

        if self.state == CaptureState::WaitingForSpeech {
            self.state = CaptureState::Recording;
            self.recording_since = Some(Instant::now());
        }
        let _ = self.events.send(CaptureEvent::Spoke);
    }

    /// At-most-one encoder per session: a live worker from a rapid
    /// back-to-back utterance is reused (any pending graceful stop
    /// withdrawn), never duplicated. A faulted worker stays down.
    fn ensure_encoder(&mut self) {
        if self.bridge.is_running() {
            self.bridge.cancel_graceful_stop();
            return;
        }
        if self.bridge.is_faulted() {
            return;
        }
        match (self.encoder_factory)() {
            Ok(encoder) => {
                self.bridge.start(encoder);
            }
            Err(e) => {
                warn!("encoder construction failed: {}", e);
                let _ = self.events.send(CaptureEvent::EncoderFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_speech_ended(&mut self) {
        let _ = self.events.send(CaptureEvent::Silenced);

        if self.cfg.keep_open_on_silence {
            // Turn-taking mode: the channel stays open across brief
            // silences and streaming continues.
            return;
        }

        self.last_segments = self.detector.padded_segments();
        self.bridge.request_graceful_stop();
        self.state = CaptureState::Finished;
    }

    fn force_stop_too_long(&mut self) {
        info!("recording exceeded the duration cap, force-stopping");
        self.clear_queues();
        self.bridge.force_stop();
        self.state = CaptureState::TooLong;
        let _ = self.events.send(CaptureEvent::TooLong);
    }

    fn trim_backlog(&mut self) {
        let keep_samples =
            (self.cfg.backlog_keep.as_secs_f64() * self.cfg.sample_rate as f64) as usize;
        if let Ok(mut q) = self.raw_queue.lock() {
            let mut total: usize = q.iter().map(|f| f.len()).sum();
            while let Some(front) = q.front() {
                if total.saturating_sub(front.len()) < keep_samples {
                    break;
                }
                total -= front.len();
                q.pop_front();
            }
        }
    }

    fn clear_queues(&mut self) {
        if let Ok(mut q) = self.raw_queue.lock() {
            q.clear();
        }
        if let Ok(mut q) = self.chunk_queue.lock() {
            q.clear();
        }
    }

    /// Write the session's raw sample history to a WAV file.
    pub fn export_wav(&self, path: &Path) -> VoiceResult<()> {
        wav::write_wav(path, &self.raw_log, self.cfg.sample_rate)
    }

    /// Test/teardown helper: block until the encode worker has exited.
    pub fn join_encoder(&mut self) {
        self.bridge.join();
    }
}
