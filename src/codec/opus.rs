use crate::error::{VoiceError, VoiceResult};

use super::{EncodedChunk, StreamDecoder, StreamEncoder};

// 20ms at 48kHz. Short frames keep the first page on the wire quickly,
// which matters more here than compression efficiency.
const FRAME_SAMPLES: usize = 960;
// Recommended max packet size for a single frame.
const MAX_PACKET: usize = 4000;
// Largest frame libopus will hand back (120ms at 48kHz).
const MAX_DECODE_SAMPLES: usize = 5760;

/// Opus-backed streaming encoder. One packet per 20ms frame is the opaque
/// page unit; the partial tail frame is held until the next feed or a flush.
pub struct OpusStreamEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    pcm: Vec<f32>,
}

impl OpusStreamEncoder {
    pub fn new(sample_rate: u32) -> VoiceResult<Self> {
        let encoder = opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| VoiceError::Codec(format!("opus encoder init: {}", e)))?;
        Ok(Self {
            encoder,
            sample_rate,
            pcm: Vec::with_capacity(FRAME_SAMPLES * 4),
        })
    }

    fn encode_frame(&mut self, frame: &[f32]) -> VoiceResult<EncodedChunk> {
        let mut packet = vec![0u8; MAX_PACKET];
        let written = self
            .encoder
            .encode_float(frame, &mut packet)
            .map_err(|e| VoiceError::Codec(format!("opus encode: {}", e)))?;
        packet.truncate(written);
        Ok(packet)
    }
}

impl StreamEncoder for OpusStreamEncoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn feed(&mut self, samples: &[f32]) -> VoiceResult<()> {
        self.pcm.extend_from_slice(samples);
        Ok(())
    }

    fn drain_pages(&mut self) -> VoiceResult<Vec<EncodedChunk>> {
        let mut pages = Vec::new();
        while self.pcm.len() >= FRAME_SAMPLES {
            let rest = self.pcm.split_off(FRAME_SAMPLES);
            let frame = std::mem::replace(&mut self.pcm, rest);
            pages.push(self.encode_frame(&frame)?);
        }
        Ok(pages)
    }

    fn flush(&mut self) -> VoiceResult<Vec<EncodedChunk>> {
        let mut pages = self.drain_pages()?;
        if !self.pcm.is_empty() {
            let mut tail = std::mem::take(&mut self.pcm);
            tail.resize(FRAME_SAMPLES, 0.0);
            pages.push(self.encode_frame(&tail)?);
        }
        Ok(pages)
    }
}

/// Opus-backed chunk decoder for the response path.
pub struct OpusChunkDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
}

impl OpusChunkDecoder {
    pub fn new(sample_rate: u32) -> VoiceResult<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)
            .map_err(|e| VoiceError::Codec(format!("opus decoder init: {}", e)))?;
        Ok(Self {
            decoder,
            sample_rate,
        })
    }
}

impl StreamDecoder for OpusChunkDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decode_chunk(&mut self, chunk: &[u8]) -> VoiceResult<Vec<f32>> {
        let mut pcm = vec![0f32; MAX_DECODE_SAMPLES];
        let decoded = self
            .decoder
            .decode_float(chunk, &mut pcm, false)
            .map_err(|e| VoiceError::Codec(format!("opus decode: {}", e)))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    fn reset(&mut self) {
        // No exposed reset on the decoder handle; a fresh one drops all
        // inter-frame prediction state.
        if let Ok(fresh) = opus::Decoder::new(self.sample_rate, opus::Channels::Mono) {
            self.decoder = fresh;
        }
    }
}
