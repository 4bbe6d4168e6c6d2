use tracing::{debug, warn};

use super::scorer::WindowScorer;

/// One speech interval in the sample coordinates of a continuous trace.
/// `end > start` once finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub start: usize,
    pub end: usize,
}

impl SpeechSegment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Per-window detector output consumed by the capture session.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Raw probability, emitted for every successfully scored window.
    Probability { position: usize, probability: f32 },
    /// A segment opened (probability crossed the enter threshold).
    SpeechStart { position: usize },
    /// A segment closed after persistent silence.
    SpeechEnd { segment: SpeechSegment },
    /// A segment was force-closed at the duration cap; a new one is already
    /// open so continued speech is not lost.
    SpeechTooLong { segment: SpeechSegment },
}

/// Tuning for the decision logic. All durations are in samples.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub window_size: usize,
    /// Enter-speech threshold.
    pub threshold: f32,
    /// Exit threshold is `threshold - hysteresis_gap`.
    pub hysteresis_gap: f32,
    /// Segments shorter than this are discarded.
    pub min_speech: usize,
    /// Silence must persist this long before a segment closes.
    pub min_silence: usize,
    /// Hard cap on a single segment's length.
    pub max_speech: usize,
    /// Outward padding applied to finalized segment ends.
    pub speech_pad: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        // Tuned for 16kHz input, 512-sample (32ms) windows
        Self {
            window_size: 512,
            threshold: 0.5,
            hysteresis_gap: 0.15,
            min_speech: 1024,       // 2 windows
            min_silence: 1536,      // 3 windows (~96ms)
            max_speech: 480_000,    // 30s
            speech_pad: 512,
        }
    }
}

/// Turns a probability trace into discrete speech-segment boundaries.
///
/// Owns only the decision logic: hysteresis thresholds, candidate-silence
/// persistence, the duration cap, and padding/merging. The probability
/// itself comes from the pluggable scorer.
pub struct SpeechActivityDetector {
    scorer: Box<dyn WindowScorer + Send>,
    cfg: DetectorConfig,

    // Position state, advanced one window per scored window
    current: usize,
    triggered: bool,
    speech_start: usize,
    silence_candidate: Option<usize>,

    segments: Vec<SpeechSegment>,
}

impl SpeechActivityDetector {
    pub fn new(scorer: Box<dyn WindowScorer + Send>, cfg: DetectorConfig) -> Self {
        Self {
            scorer,
            cfg,
            current: 0,
            triggered: false,
            speech_start: 0,
            silence_candidate: None,
            segments: Vec::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    pub fn in_speech(&self) -> bool {
        self.triggered
    }

    /// Absolute sample position (end of the last accepted window).
    pub fn position(&self) -> usize {
        self.current
    }

    /// Score one window and run the decision logic.
    ///
    /// A scorer failure is logged and treated as "no decision": the clock
    /// still advances so positions stay aligned with the audio, but no
    /// events are produced for that window.
    pub fn process_window(&mut self, window: &[f32]) -> Vec<VadEvent> {
        let probability = if window.len() == self.cfg.window_size {
            self.scorer.score_window(window)
        } else {
            // Short trailing window: zero-pad to size
            let mut padded = window.to_vec();
            padded.resize(self.cfg.window_size, 0.0);
            self.scorer.score_window(&padded)
        };

        self.current += self.cfg.window_size;

        let probability = match probability {
            Ok(p) => p,
            Err(e) => {
                warn!("scorer failed, skipping window: {}", e);
                return Vec::new();
            }
        };

        let mut events = vec![VadEvent::Probability {
            position: self.current,
            probability,
        }];

        let low = self.cfg.threshold - self.cfg.hysteresis_gap;

        if !self.triggered {
            if probability >= self.cfg.threshold {
                self.triggered = true;
                self.speech_start = self.current.saturating_sub(self.cfg.window_size);
                self.silence_candidate = None;
                debug!("speech opened at sample {}", self.speech_start);
                events.push(VadEvent::SpeechStart {
                    position: self.speech_start,
                });
            }
            return events;
        }

        // Duration cap first: emit the elapsed audio as a completed segment
        // and re-open immediately. Closing at the cap keeps every emitted
        // segment within the budget.
        if self.current - self.speech_start >= self.cfg.max_speech {
            let segment = SpeechSegment {
                start: self.speech_start,
                end: self.current,
            };
            self.segments.push(segment);
            self.speech_start = self.current;
            self.silence_candidate = None;
            debug!("speech force-closed at duration cap: {:?}", segment);
            events.push(VadEvent::SpeechTooLong { segment });
            return events;
        }

        if probability < low {
            let candidate = *self.silence_candidate.get_or_insert(self.current);
            if self.current - candidate >= self.cfg.min_silence {
                let segment = SpeechSegment {
                    start: self.speech_start,
                    end: candidate,
                };
                self.triggered = false;
                self.silence_candidate = None;
                if segment.len() >= self.cfg.min_speech {
                    self.segments.push(segment);
                }
                debug!("speech closed: {:?}", segment);
                events.push(VadEvent::SpeechEnd { segment });
            }
        } else {
            // Speech resumed (or a dip stayed above the exit threshold):
            // the candidate is discarded, the segment stays open.
            self.silence_candidate = None;
        }

        events
    }

    /// End of input: emit a still-open segment if it is long enough.
    pub fn finish(&mut self) -> Vec<VadEvent> {
        let mut events = Vec::new();
        if self.triggered {
            let segment = SpeechSegment {
                start: self.speech_start,
                end: self.current,
            };
            self.triggered = false;
            self.silence_candidate = None;
            if segment.len() >= self.cfg.min_speech {
                self.segments.push(segment);
                events.push(VadEvent::SpeechEnd { segment });
            }
        }
        events
    }

    /// Finalized segments, in order, unpadded.
    pub fn segments(&self) -> &[SpeechSegment] {
        &self.segments
    }

    /// Segments with `speech_pad` applied outward, clamped to stream bounds.
    /// Neighbors closer than 2x pad split the gap evenly instead of padding
    /// into each other, so results never overlap.
    pub fn padded_segments(&self) -> Vec<SpeechSegment> {
        let pad = self.cfg.speech_pad;
        let n = self.segments.len();
        let mut out = Vec::with_capacity(n);

        for (i, seg) in self.segments.iter().enumerate() {
            let start = if i > 0 {
                let gap = seg.start - self.segments[i - 1].end;
                if gap < 2 * pad {
                    seg.start - (gap - gap / 2)
                } else {
                    seg.start - pad
                }
            } else {
                seg.start.saturating_sub(pad)
            };

            let end = if i + 1 < n {
                let gap = self.segments[i + 1].start - seg.end;
                if gap < 2 * pad {
                    seg.end + gap / 2
                } else {
                    seg.end + pad
                }
            } else {
                (seg.end + pad).min(self.current)
            };

            out.push(SpeechSegment { start, end });
        }

        out
    }

    /// Clear all decision state and the scorer's internal state.
    pub fn reset(&mut self) {
        self.current = 0;
        self.triggered = false;
        self.speech_start = 0;
        self.silence_candidate = None;
        self.segments.clear();
        self.scorer.reset();
    }
}
