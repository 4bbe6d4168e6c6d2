pub mod opus;

use crate::error::VoiceResult;

pub use opus::{OpusChunkDecoder, OpusStreamEncoder};

/// Opaque compressed byte buffer. FIFO ordering across the chunk queue is
/// the only guarantee.
pub type EncodedChunk = Vec<u8>;

/// Streaming lossy encoder, packet-in/page-out.
///
/// The bitstream internals are none of our business: samples go in, the
/// pages the codec is willing to emit *now* come out. Implementations buffer
/// whatever partial frame remains between calls.
pub trait StreamEncoder: Send {
    /// Target sample rate the bridge must resample to before feeding.
    fn sample_rate(&self) -> u32;

    /// Append mono samples at `sample_rate()`.
    fn feed(&mut self, samples: &[f32]) -> VoiceResult<()>;

    /// Encode and return every page that is ready now, without waiting for
    /// a fuller internal buffer. Favors latency over compression.
    fn drain_pages(&mut self) -> VoiceResult<Vec<EncodedChunk>>;

    /// Forced flush: pad and emit the remaining partial page, even if that
    /// costs compression. Nothing may be silently dropped.
    fn flush(&mut self) -> VoiceResult<Vec<EncodedChunk>>;
}

/// Mirror of the encoder for the response path: one opaque chunk in, its
/// decoded samples out.
pub trait StreamDecoder: Send {
    fn sample_rate(&self) -> u32;

    fn decode_chunk(&mut self, chunk: &[u8]) -> VoiceResult<Vec<f32>>;

    /// Drop inter-chunk prediction state on stream reset.
    fn reset(&mut self);
}

/// Builds a fresh encoder per encode-bridge worker.
pub type EncoderFactory = Box<dyn Fn() -> VoiceResult<Box<dyn StreamEncoder>> + Send + Sync>;
