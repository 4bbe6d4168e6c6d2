use std::path::Path;

use crate::error::{VoiceError, VoiceResult};

/// Write a raw f32 sample log to a 16-bit mono WAV file.
/// Used for the "here is what you said" session export.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> VoiceResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| VoiceError::Capture(format!("wav create failed: {}", e)))?;

    for &sample in samples {
        let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(clamped)
            .map_err(|e| VoiceError::Capture(format!("wav write failed: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| VoiceError::Capture(format!("wav finalize failed: {}", e)))
}
