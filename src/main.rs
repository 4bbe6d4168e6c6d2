use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use colloquy::audio::frame::AudioFrame;
use colloquy::audio::MicrophoneSource;
use colloquy::codec::{OpusChunkDecoder, OpusStreamEncoder, StreamEncoder};
use colloquy::config::{CaptureConfig, ConversationConfig, PlaybackConfig};
use colloquy::protocol::AudioWireConfig;
use colloquy::session::{CaptureSession, ConversationSession, PlaybackBuffer};
use colloquy::vad::{DetectorConfig, SpeechActivityDetector, WebrtcWindowScorer};

// Encoder side of the wire: Opus at 48kHz mono.
const ENCODE_RATE: u32 = 48_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let url = std::env::var("COLLOQUY_URL")
        .unwrap_or_else(|_| "ws://localhost:8765/stream".to_string());
    let token = std::env::var("COLLOQUY_TOKEN").unwrap_or_default();

    tracing::info!("colloquy demo starting, service at {}", url);

    // Host-facing event stream
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    // Capture events into the conversation driver
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();

    // Microphone -> lock-free ring buffer -> ingestion thread.
    // 0.5s of headroom so scheduling jitter never drops samples.
    use ringbuf::traits::Split;
    use ringbuf::HeapRb;
    let rb = HeapRb::<f32>::new(8192);
    let (producer, mut consumer) = rb.split();

    let mic = MicrophoneSource::open(producer, event_tx.clone())
        .context("failed to open microphone")?;
    let mic_rate = mic.sample_rate;
    tracing::info!("microphone open at {}Hz", mic_rate);

    let scorer = WebrtcWindowScorer::new(mic_rate, 3)
        .map_err(|e| anyhow::anyhow!("vad init: {}", e))?;
    let detector_cfg = DetectorConfig {
        min_speech: mic_rate as usize / 4,  // 250ms
        min_silence: mic_rate as usize / 2, // 500ms
        max_speech: mic_rate as usize * 30,
        ..Default::default()
    };
    let detector = SpeechActivityDetector::new(Box::new(scorer), detector_cfg);

    let encoder_factory = Box::new(|| {
        OpusStreamEncoder::new(ENCODE_RATE).map(|e| Box::new(e) as Box<dyn StreamEncoder>)
    });

    let capture_cfg = CaptureConfig {
        sample_rate: mic_rate,
        ..Default::default()
    };
    let capture = Arc::new(Mutex::new(CaptureSession::new(
        capture_cfg,
        detector,
        encoder_factory,
        capture_tx,
    )));

    // Ingestion thread: ring buffer -> ~30ms frames -> capture session
    {
        let capture = capture.clone();
        let frame_len = (mic_rate as usize * 30) / 1000;
        std::thread::spawn(move || {
            use ringbuf::traits::{Consumer, Observer};
            let mut buf = vec![0f32; frame_len];
            loop {
                if consumer.occupied_len() < frame_len {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                let _ = consumer.pop_slice(&mut buf);
                if let Ok(mut session) = capture.lock() {
                    session.ingest_frame(AudioFrame::new(buf.clone(), mic_rate));
                }
            }
        });
    }

    let decoder = OpusChunkDecoder::new(ENCODE_RATE)
        .map_err(|e| anyhow::anyhow!("decoder init: {}", e))?;
    let playback = Arc::new(PlaybackBuffer::new(PlaybackConfig::default(), Box::new(decoder)));

    // Stand-in for the host's audio output callback: pull decoded samples
    // at a real-time pace. A real host copies them into its output buffer.
    {
        let playback = playback.clone();
        std::thread::spawn(move || {
            let mut out = vec![0f32; (ENCODE_RATE as usize * 20) / 1000];
            loop {
                playback.read(&mut out);
                std::thread::sleep(Duration::from_millis(20));
            }
        });
    }

    let connector: colloquy::session::Connector = Box::new(move || {
        let url = url.clone();
        let fut: futures_util::future::BoxFuture<
            'static,
            colloquy::VoiceResult<colloquy::protocol::Transport>,
        > = Box::pin(async move { colloquy::protocol::connect(&url).await });
        fut
    });

    let wire_config = AudioWireConfig {
        sample_rate: ENCODE_RATE,
        mime_type: "audio/opus".to_string(),
    };
    let (driver, handle) = ConversationSession::new(
        token,
        wire_config,
        capture.clone(),
        playback,
        connector,
        capture_rx,
        event_tx,
    );
    tokio::spawn(driver.run());

    // Event printer
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[event] {:?}", event);
        }
    });

    println!("commands: start | pause | resume | stop | clear | export <path> | quit");

    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let result = match line {
            "" => continue,
            "start" => handle.start_conversation(ConversationConfig::default()),
            "pause" => handle.pause_conversation(),
            "resume" => handle.resume_conversation(),
            "stop" => handle.stop_conversation(),
            "clear" => handle.clear_conversation(),
            "quit" => {
                let _ = handle.shutdown();
                break;
            }
            other => {
                if let Some(path) = other.strip_prefix("export ") {
                    let exported = capture
                        .lock()
                        .ok()
                        .map(|c| c.export_wav(std::path::Path::new(path)));
                    match exported {
                        Some(Ok(())) => println!("wrote {}", path),
                        Some(Err(e)) => println!("export failed: {}", e),
                        None => println!("capture session unavailable"),
                    }
                } else {
                    println!("unknown command: {}", other);
                }
                continue;
            }
        };
        if let Err(e) = result {
            tracing::error!("command failed: {}", e);
            break;
        }
    }

    Ok(())
}
