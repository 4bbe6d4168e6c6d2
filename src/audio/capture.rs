use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::Producer;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::VoiceError;
use crate::event::ConversationEvent;

/// Microphone capture source. Holds the live cpal stream; dropping it stops
/// capture. Samples land in the lock-free producer the ingestion thread
/// drains, so the audio callback never blocks or allocates.
pub struct MicrophoneSource {
    _stream: cpal::Stream,
    pub sample_rate: u32,
}

// Rates the scorer backends accept. 16k first: cheapest that still covers
// the speech band.
const TARGET_RATES: [u32; 4] = [16_000, 32_000, 48_000, 8_000];

impl MicrophoneSource {
    /// Open the default input device at the first supported rate.
    ///
    /// Device failures and permission denials surface as a `CaptureFailed`
    /// event on `events` (and an error return here); they must not crash the
    /// session, only block recording.
    pub fn open<P>(
        mut producer: P,
        events: mpsc::UnboundedSender<ConversationEvent>,
    ) -> Result<Self, VoiceError>
    where
        P: Producer<Item = f32> + Send + 'static,
    {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let reason = "no input device available".to_string();
                let _ = events.send(ConversationEvent::CaptureFailed { reason: reason.clone() });
                return Err(VoiceError::Capture(reason));
            }
        };

        info!("input device: {}", device.name().unwrap_or_default());

        let mut selected = None;
        for &rate in &TARGET_RATES {
            let ranges = device
                .supported_input_configs()
                .map_err(|e| VoiceError::Capture(format!("query input configs: {}", e)))?;
            for range in ranges {
                if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
                    selected = Some((range.with_sample_rate(cpal::SampleRate(rate)), rate));
                    break;
                }
            }
            if selected.is_some() {
                break;
            }
        }

        let (config, sample_rate) = match selected {
            Some(found) => found,
            None => {
                // Fall back to the device default, but only if it is a rate
                // the scorer can actually consume.
                let def = device
                    .default_input_config()
                    .map_err(|e| VoiceError::Capture(format!("default input config: {}", e)))?;
                let rate = def.sample_rate().0;
                if !TARGET_RATES.contains(&rate) {
                    let reason = format!("unsupported input rate {}Hz", rate);
                    let _ = events.send(ConversationEvent::CaptureFailed { reason: reason.clone() });
                    return Err(VoiceError::Capture(reason));
                }
                (def, rate)
            }
        };

        info!(
            "capture config: {}Hz, {} channel(s)",
            sample_rate,
            config.channels()
        );

        let channels = config.channels() as usize;
        let err_events = events.clone();
        let err_fn = move |err: cpal::StreamError| {
            warn!("capture stream error: {}", err);
            let _ = err_events.send(ConversationEvent::CaptureFailed {
                reason: err.to_string(),
            });
        };

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &_| push_f32(data, channels, &mut producer),
                    err_fn,
                    None,
                )
                .map_err(|e| VoiceError::Capture(format!("build input stream: {}", e)))?,
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &_| push_i16(data, channels, &mut producer),
                    err_fn,
                    None,
                )
                .map_err(|e| VoiceError::Capture(format!("build input stream: {}", e)))?,
            other => {
                let reason = format!("unsupported sample format {:?}", other);
                let _ = events.send(ConversationEvent::CaptureFailed { reason: reason.clone() });
                return Err(VoiceError::Capture(reason));
            }
        };

        stream
            .play()
            .map_err(|e| VoiceError::Capture(format!("stream start: {}", e)))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }
}

// If the ring buffer is full we drop samples (lossy). The consumer is sized
// generously; sustained overflow means the ingestion thread is wedged and
// losing audio is the least bad option.
fn push_f32<P>(input: &[f32], channels: usize, producer: &mut P)
where
    P: Producer<Item = f32>,
{
    if channels <= 1 {
        producer.push_slice(input);
    } else {
        for frame in input.chunks_exact(channels) {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            let _ = producer.try_push(mono);
        }
    }
}

fn push_i16<P>(input: &[i16], channels: usize, producer: &mut P)
where
    P: Producer<Item = f32>,
{
    if channels <= 1 {
        for &sample in input {
            let _ = producer.try_push(sample as f32 / i16::MAX as f32);
        }
    } else {
        for frame in input.chunks_exact(channels) {
            let sum: f32 = frame.iter().map(|&s| s as f32 / i16::MAX as f32).sum();
            let _ = producer.try_push(sum / channels as f32);
        }
    }
}
