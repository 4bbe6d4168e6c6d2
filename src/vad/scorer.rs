use tracing::debug;
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::error::{VoiceError, VoiceResult};

/// Black-box speech-probability capability.
///
/// The detector never assumes a specific inference engine; any backend that
/// can turn a fixed-size sample window into a probability plugs in here.
pub trait WindowScorer {
    /// Score one window of mono samples in -1..1. Returns a probability in
    /// [0, 1].
    fn score_window(&mut self, window: &[f32]) -> VoiceResult<f32>;

    /// Drop any internal state between recordings.
    fn reset(&mut self) {}
}

/// WebRTC-VAD backed scorer.
///
/// The engine votes speech/non-speech per 10 ms subframe; the window score is
/// the fraction of speech votes, which gives the hysteresis thresholds real
/// gradations to work with instead of a bare 0/1.
pub struct WebrtcWindowScorer {
    vad: Vad,
    sample_rate: u32,
    mode: u8,
    subframe: usize,
}

// The underlying fvad state is plain heap memory with no thread affinity;
// all access is serialized through &mut self.
unsafe impl Send for WebrtcWindowScorer {}

impl WebrtcWindowScorer {
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        if !matches!(sample_rate, 8_000 | 16_000 | 32_000 | 48_000) {
            return Err(VoiceError::Vad(format!(
                "webrtc vad supports 8k/16k/32k/48k only, got {}Hz",
                sample_rate
            )));
        }
        if mode > 3 {
            return Err(VoiceError::Vad(format!("vad mode must be 0-3, got {}", mode)));
        }

        Ok(Self {
            vad: build_vad(sample_rate, mode),
            sample_rate,
            mode,
            // 10ms is the smallest frame the engine accepts
            subframe: sample_rate as usize / 100,
        })
    }
}

fn build_vad(sample_rate: u32, mode: u8) -> Vad {
    let vad_mode = match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };
    let rate = match sample_rate {
        8_000 => SampleRate::Rate8kHz,
        16_000 => SampleRate::Rate16kHz,
        32_000 => SampleRate::Rate32kHz,
        _ => SampleRate::Rate48kHz,
    };

    let mut vad = Vad::new();
    vad.set_mode(vad_mode);
    vad.set_sample_rate(rate);
    vad
}

impl WindowScorer for WebrtcWindowScorer {
    fn score_window(&mut self, window: &[f32]) -> VoiceResult<f32> {
        if window.len() < self.subframe {
            return Err(VoiceError::Vad(format!(
                "window of {} samples is below one 10ms subframe ({})",
                window.len(),
                self.subframe
            )));
        }

        let mut subframe_i16 = vec![0i16; self.subframe];
        let mut votes = 0usize;
        let mut total = 0usize;

        for chunk in window.chunks_exact(self.subframe) {
            for (dst, &src) in subframe_i16.iter_mut().zip(chunk) {
                *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            }
            let is_speech = self
                .vad
                .is_voice_segment(&subframe_i16)
                .map_err(|e| VoiceError::Vad(format!("vad scoring failed: {:?}", e)))?;
            if is_speech {
                votes += 1;
            }
            total += 1;
        }

        let probability = votes as f32 / total as f32;
        debug!("vad window score: {:.2} ({}/{} subframes)", probability, votes, total);
        Ok(probability)
    }

    fn reset(&mut self) {
        // The engine has no explicit reset; recreate it.
        self.vad = build_vad(self.sample_rate, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_rate() {
        assert!(WebrtcWindowScorer::new(44_100, 3).is_err());
    }

    #[test]
    fn rejects_bad_mode() {
        assert!(WebrtcWindowScorer::new(16_000, 4).is_err());
    }

    #[test]
    fn silence_scores_low() {
        let mut scorer = WebrtcWindowScorer::new(16_000, 3).unwrap();
        let silence = vec![0.0f32; 512];
        let p = scorer.score_window(&silence).unwrap();
        assert!(p <= 0.5, "silence should not look like speech, got {}", p);
    }

    #[test]
    fn short_window_is_an_error() {
        let mut scorer = WebrtcWindowScorer::new(16_000, 3).unwrap();
        let tiny = vec![0.0f32; 80];
        assert!(scorer.score_window(&tiny).is_err());
    }
}
