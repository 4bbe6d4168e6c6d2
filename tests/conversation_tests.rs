use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use colloquy::audio::frame::AudioFrame;
use colloquy::codec::{EncodedChunk, StreamDecoder, StreamEncoder};
use colloquy::config::{CaptureConfig, ConversationConfig, PlaybackConfig};
use colloquy::event::ConversationEvent;
use colloquy::protocol::{
    AudioWireConfig, Inbound, InteractionEvent, Outbound, OutboundMessage, Transport,
    TransportItem,
};
use colloquy::session::{
    CaptureEvent, CaptureSession, CaptureState, Connector, ConversationHandle,
    ConversationSession, PlaybackBuffer,
};
use colloquy::vad::{DetectorConfig, SpeechActivityDetector, WindowScorer};
use colloquy::{VoiceError, VoiceResult};

const RATE: u32 = 16_000;
const WINDOW: usize = 512;

struct AlwaysSpeech;

impl WindowScorer for AlwaysSpeech {
    fn score_window(&mut self, _window: &[f32]) -> VoiceResult<f32> {
        Ok(0.9)
    }
}

/// One page per fed frame, one byte per sample.
struct FrameEncoder {
    pending: Vec<EncodedChunk>,
}

impl StreamEncoder for FrameEncoder {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn feed(&mut self, samples: &[f32]) -> VoiceResult<()> {
        self.pending.push(vec![0xAA; samples.len()]);
        Ok(())
    }

    fn drain_pages(&mut self) -> VoiceResult<Vec<EncodedChunk>> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn flush(&mut self) -> VoiceResult<Vec<EncodedChunk>> {
        self.drain_pages()
    }
}

struct ByteDecoder;

impl StreamDecoder for ByteDecoder {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn decode_chunk(&mut self, chunk: &[u8]) -> VoiceResult<Vec<f32>> {
        Ok(chunk.iter().map(|&b| b as f32 / 255.0).collect())
    }

    fn reset(&mut self) {}
}

struct Harness {
    handle: ConversationHandle,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    in_tx: mpsc::UnboundedSender<TransportItem>,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    capture: Arc<Mutex<CaptureSession>>,
    playback: Arc<PlaybackBuffer>,
}

fn harness() -> Harness {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();

    let detector_cfg = DetectorConfig {
        window_size: WINDOW,
        min_speech: WINDOW,
        min_silence: 3 * WINDOW,
        ..Default::default()
    };
    let detector = SpeechActivityDetector::new(Box::new(AlwaysSpeech), detector_cfg);
    let factory = Box::new(|| {
        Ok(Box::new(FrameEncoder { pending: Vec::new() }) as Box<dyn StreamEncoder>)
    });
    let capture = Arc::new(Mutex::new(CaptureSession::new(
        CaptureConfig {
            sample_rate: RATE,
            ..Default::default()
        },
        detector,
        factory,
        capture_tx.clone(),
    )));

    let playback_cfg = PlaybackConfig {
        sample_rate: RATE,
        base_threshold: 16,
        buffering_level: 1,
        output_latency: Duration::from_millis(50),
    };
    let playback = Arc::new(PlaybackBuffer::new(playback_cfg, Box::new(ByteDecoder)));

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let transport = Transport::from_channels(out_tx, in_rx);

    let mut slot = Some(transport);
    let connector: Connector = Box::new(move || {
        let transport = slot.take();
        let fut: BoxFuture<'static, VoiceResult<Transport>> = Box::pin(async move {
            transport.ok_or_else(|| VoiceError::Transport("transport already taken".to_string()))
        });
        fut
    });

    let wire_config = AudioWireConfig {
        sample_rate: RATE,
        mime_type: "audio/opus".to_string(),
    };
    let (driver, handle) = ConversationSession::new(
        "test-token".to_string(),
        wire_config,
        capture.clone(),
        playback.clone(),
        connector,
        capture_rx,
        event_tx,
    );
    tokio::spawn(driver.run());

    Harness {
        handle,
        events: event_rx,
        out_rx,
        in_tx,
        capture_tx,
        capture,
        playback,
    }
}

async fn recv_out(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("outbound channel closed")
}

async fn wait_event(
    rx: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    pred: impl Fn(&ConversationEvent) -> bool,
) -> ConversationEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

async fn wait_capture_state(capture: &Arc<Mutex<CaptureSession>>, state: CaptureState) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if capture.lock().unwrap().state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for capture state")
}

fn send_inbound(h: &Harness, msg: Inbound) {
    h.in_tx.send(TransportItem::Message(msg)).unwrap();
}

/// Start a conversation and consume the protocol preamble.
async fn start(h: &mut Harness) {
    h.handle
        .start_conversation(ConversationConfig::default())
        .unwrap();

    let m1 = recv_out(&mut h.out_rx).await;
    assert!(matches!(m1.kind, Outbound::Authenticate { .. }));
    let m2 = recv_out(&mut h.out_rx).await;
    assert!(matches!(m2.kind, Outbound::SetConfiguration { .. }));
    let m3 = recv_out(&mut h.out_rx).await;
    assert!(matches!(m3.kind, Outbound::GetConfiguration {}));
    let m4 = recv_out(&mut h.out_rx).await;
    match m4.kind {
        Outbound::Interact { text, kind, .. } => {
            assert_eq!(text.as_deref(), Some("start"));
            assert_eq!(kind, "stream");
        }
        other => panic!("expected the initial interact, got {:?}", other),
    }

    wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::ProcessingStarted)
    })
    .await;
    wait_capture_state(&h.capture, CaptureState::WaitingForSpeech).await;
}

#[tokio::test]
async fn start_sends_the_protocol_preamble_in_order() {
    let mut h = harness();
    start(&mut h).await;
}

#[tokio::test]
async fn text_fragments_and_turn_completion_flow_to_the_host() {
    let mut h = harness();
    start(&mut h).await;

    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::InteractionStarted,
        },
    );
    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::Text {
                text: "hel".to_string(),
            },
        },
    );
    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::Text {
                text: "lo".to_string(),
            },
        },
    );

    let ev = wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::TextReceived { .. })
    })
    .await;
    match ev {
        ConversationEvent::TextReceived { text, turn } => {
            assert_eq!(text, "hel");
            assert_eq!(turn, 0);
        }
        _ => unreachable!(),
    }

    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::InteractionComplete,
        },
    );
    let ev = wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::TurnCompleted { .. })
    })
    .await;
    assert!(matches!(ev, ConversationEvent::TurnCompleted { turn: 1 }));
}

#[tokio::test]
async fn server_error_surfaces_and_is_not_retried() {
    let mut h = harness();
    start(&mut h).await;

    send_inbound(
        &h,
        Inbound::Error {
            error: "bad things".to_string(),
        },
    );
    wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::Error { .. })
    })
    .await;

    // No automatic retry: nothing further goes out
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        h.out_rx.try_recv().is_err(),
        "an errored conversation must not send more messages"
    );
}

#[tokio::test]
async fn barge_in_clears_audio_before_forwarding_the_new_turn() {
    let mut h = harness();
    start(&mut h).await;

    // A response is streaming: cross the playback threshold
    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::Audio {
                audio: BASE64.encode(vec![9u8; 64]),
            },
        },
    );
    wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::PlaybackStarted)
    })
    .await;
    assert!(h.playback.decoded_len() > 0);

    // The user starts talking over it
    for _ in 0..3 {
        h.capture
            .lock()
            .unwrap()
            .ingest_frame(AudioFrame::new(vec![0.5; WINDOW], RATE));
    }
    wait_event(&mut h.events, |e| matches!(e, ConversationEvent::PlayerSpoke)).await;

    // clear_audio must precede any add_audio of the new turn
    let mut saw_clear = false;
    loop {
        let msg = recv_out(&mut h.out_rx).await;
        match msg.kind {
            Outbound::ClearAudio {} => {
                saw_clear = true;
                assert_eq!(
                    h.playback.decoded_len(),
                    0,
                    "playback must be flushed before the next chunk lands"
                );
            }
            Outbound::AddAudio { ref audio, .. } => {
                assert!(
                    saw_clear,
                    "add_audio for the new turn must come after clear_audio"
                );
                let bytes = BASE64.decode(audio).unwrap();
                assert!(!bytes.is_empty());
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn silence_retry_budget_stops_the_conversation_exactly_once() {
    let mut h = harness();
    start(&mut h).await;

    for _ in 0..3 {
        h.capture_tx.send(CaptureEvent::SilenceTimeout).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    wait_event(&mut h.events, |e| matches!(e, ConversationEvent::Stopped)).await;

    // Settle, then verify no duplicate stop and no resume attempts
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut stops = 0;
    while let Ok(ev) = h.events.try_recv() {
        if matches!(ev, ConversationEvent::Stopped) {
            stops += 1;
        }
    }
    assert_eq!(stops, 0, "stop must be invoked exactly once");
}

#[tokio::test]
async fn below_budget_silence_timeouts_rearm_recording() {
    let mut h = harness();
    start(&mut h).await;

    // Knock the capture session out of WaitingForSpeech, then time out once
    h.capture.lock().unwrap().stop_recording();
    h.capture_tx.send(CaptureEvent::SilenceTimeout).unwrap();

    let ev = wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::SilenceTimeout { .. })
    })
    .await;
    assert!(matches!(ev, ConversationEvent::SilenceTimeout { attempt: 1 }));

    // The driver re-arms the microphone instead of stopping
    wait_capture_state(&h.capture, CaptureState::WaitingForSpeech).await;
}

#[tokio::test]
async fn pause_clears_audio_and_resume_reissues_the_interact() {
    let mut h = harness();
    start(&mut h).await;

    h.handle.pause_conversation().unwrap();
    let msg = recv_out(&mut h.out_rx).await;
    assert!(matches!(msg.kind, Outbound::ClearAudio {}));
    wait_event(&mut h.events, |e| matches!(e, ConversationEvent::Paused)).await;
    assert_eq!(h.capture.lock().unwrap().state(), CaptureState::Interrupted);

    h.handle.resume_conversation().unwrap();
    let msg = recv_out(&mut h.out_rx).await;
    match msg.kind {
        Outbound::Interact { text, .. } => assert_eq!(text.as_deref(), Some("resume")),
        other => panic!("expected a resume interact, got {:?}", other),
    }
    wait_event(&mut h.events, |e| matches!(e, ConversationEvent::Resumed)).await;
    wait_capture_state(&h.capture, CaptureState::WaitingForSpeech).await;
}

#[tokio::test]
async fn finished_playback_rearms_the_microphone() {
    let mut h = harness();
    start(&mut h).await;

    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::Audio {
                audio: BASE64.encode(vec![5u8; 64]),
            },
        },
    );
    wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::PlaybackStarted)
    })
    .await;

    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::AudioComplete,
        },
    );
    send_inbound(
        &h,
        Inbound::Interaction {
            event: InteractionEvent::InteractionComplete,
        },
    );

    // Drive the output puller until the decoded buffer is consumed
    let mut out = [0f32; 64];
    h.playback.read(&mut out);

    wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::PlaybackFinished)
    })
    .await;
    wait_capture_state(&h.capture, CaptureState::WaitingForSpeech).await;
}

#[tokio::test]
async fn transport_close_moves_the_session_to_error() {
    let mut h = harness();
    start(&mut h).await;

    h.in_tx
        .send(TransportItem::Closed {
            reason: Some("gone".to_string()),
        })
        .unwrap();

    let ev = wait_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::Error { .. })
    })
    .await;
    match ev {
        ConversationEvent::Error { reason } => assert!(reason.contains("gone")),
        _ => unreachable!(),
    }
}
