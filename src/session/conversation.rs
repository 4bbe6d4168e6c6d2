use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConversationConfig, TurnMode};
use crate::error::{VoiceError, VoiceResult};
use crate::event::ConversationEvent;
use crate::protocol::{AudioWireConfig, Inbound, InteractionEvent, Outbound, OutboundMessage};
use crate::protocol::{Transport, TransportItem};

use super::capture::{CaptureEvent, CaptureSession};
use super::playback::PlaybackBuffer;

// Accumulated encoded audio is forwarded once the batch reaches this size,
// or immediately once capture has stopped and the encoder has drained.
const FORWARD_BATCH_BYTES: usize = 512;

// Driver cadence. Also the audio-forward and guard poll interval, so
// cancellation and drain conditions are observed within tens of ms.
const TICK: Duration = Duration::from_millis(20);

/// Top-level protocol state. Lives for the process lifetime; `Idle` between
/// conversations, `Error` is terminal for the current conversation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Processing,
    Recording,
    Playing,
    Paused,
    Error,
}

/// Opens the duplex stream on demand. A fresh transport per conversation;
/// tests substitute a scripted channel pair.
pub type Connector =
    Box<dyn FnMut() -> BoxFuture<'static, VoiceResult<Transport>> + Send>;

enum Command {
    Start(Box<ConversationConfig>),
    Pause,
    Resume,
    Stop,
    Clear,
    SetConfiguration(Box<ConversationConfig>),
    Shutdown,
}

/// Clonable host-facing control surface for the driver task.
#[derive(Clone)]
pub struct ConversationHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConversationHandle {
    pub fn start_conversation(&self, config: ConversationConfig) -> VoiceResult<()> {
        self.send(Command::Start(Box::new(config)))
    }

    pub fn pause_conversation(&self) -> VoiceResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume_conversation(&self) -> VoiceResult<()> {
        self.send(Command::Resume)
    }

    pub fn stop_conversation(&self) -> VoiceResult<()> {
        self.send(Command::Stop)
    }

    pub fn clear_conversation(&self) -> VoiceResult<()> {
        self.send(Command::Clear)
    }

    pub fn set_configuration(&self, config: ConversationConfig) -> VoiceResult<()> {
        self.send(Command::SetConfiguration(Box::new(config)))
    }

    /// Terminate the driver task itself.
    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, cmd: Command) -> VoiceResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| VoiceError::Session("conversation driver is gone".to_string()))
    }
}

/// The conversation state machine: composes the capture session and the
/// playback buffer over the duplex message stream, and owns turn-taking,
/// barge-in, silence-retry, and the audio-forward loop.
///
/// Runs as a single driver task; the host talks to it through
/// [`ConversationHandle`] and drains the typed event channel.
pub struct ConversationSession {
    state: SessionState,
    config: ConversationConfig,
    access_token: String,
    wire_config: AudioWireConfig,

    turn: u64,
    silence_retries: u32,
    interaction_active: bool,
    /// An audio response is streaming or rendering.
    playback_active: bool,
    /// The per-utterance forward loop is live: encoded chunks flow out as
    /// `add_audio` until capture stops, the encoder drains, and the local
    /// backlog empties.
    audio_session_open: bool,
    current_utterance: Option<String>,
    forward_buf: Vec<u8>,

    capture: Arc<Mutex<CaptureSession>>,
    playback: Arc<PlaybackBuffer>,

    connector: Connector,
    transport: Option<Transport>,

    commands: Option<mpsc::UnboundedReceiver<Command>>,
    capture_events: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    events: mpsc::UnboundedSender<ConversationEvent>,
    cancel: CancellationToken,
}

impl ConversationSession {
    pub fn new(
        access_token: String,
        wire_config: AudioWireConfig,
        capture: Arc<Mutex<CaptureSession>>,
        playback: Arc<PlaybackBuffer>,
        connector: Connector,
        capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
        events: mpsc::UnboundedSender<ConversationEvent>,
    ) -> (Self, ConversationHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            state: SessionState::Idle,
            config: ConversationConfig::default(),
            access_token,
            wire_config,
            turn: 0,
            silence_retries: 0,
            interaction_active: false,
            playback_active: false,
            audio_session_open: false,
            current_utterance: None,
            forward_buf: Vec::new(),
            capture,
            playback,
            connector,
            transport: None,
            commands: Some(rx),
            capture_events: Some(capture_events),
            events,
            cancel: CancellationToken::new(),
        };
        (session, ConversationHandle { tx })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Driver loop. Commands arrive on their own channel; capture events
    /// and inbound protocol messages are drained on the cadence tick, which
    /// also runs the forward loop and the playback drain check.
    pub async fn run(mut self) {
        let (mut commands, mut capture_events) =
            match (self.commands.take(), self.capture_events.take()) {
                (Some(c), Some(e)) => (c, e),
                _ => return,
            };
        let cancel = self.cancel.clone();

        let mut cadence = tokio::time::interval(TICK);
        cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("conversation driver active");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                _ = cadence.tick() => {
                    while let Ok(ev) = capture_events.try_recv() {
                        self.handle_capture_event(ev);
                    }
                    self.drain_inbound();
                    self.forward_audio();
                    self.check_playback();
                }
            }
        }

        self.stop();
        info!("conversation driver exited");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(config) => self.start_conversation(*config).await,
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::Clear => self.clear(),
            Command::SetConfiguration(config) => self.set_configuration(*config),
            Command::Shutdown => {}
        }
    }

    async fn start_conversation(&mut self, config: ConversationConfig) {
        if self.state != SessionState::Idle {
            // Already mid-conversation: treat as a resume, not a fresh
            // session.
            debug!("start on a non-idle session, sending resume");
            let text = Some(self.config.resume_command.clone());
            self.send(Outbound::interact(&self.config, text));
            self.state = SessionState::Processing;
            return;
        }

        self.config = config;
        self.turn = 0;
        self.silence_retries = 0;

        match (self.connector)().await {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                self.fail(format!("connect failed: {}", e));
                return;
            }
        }

        self.send(Outbound::Authenticate {
            access_token: self.access_token.clone(),
        });
        self.send(Outbound::SetConfiguration {
            config: self.config.clone(),
        });
        self.send(Outbound::GetConfiguration {});
        let start = Some(self.config.start_command.clone());
        self.send(Outbound::interact(&self.config, start));
        self.interaction_active = true;

        self.state = SessionState::Processing;
        self.emit(ConversationEvent::ProcessingStarted);

        if let Ok(mut capture) = self.capture.lock() {
            capture.set_keep_open_on_silence(self.config.turn_mode == TurnMode::KeepOpen);
            capture.start_recording();
        }
    }

    fn pause(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Paused) {
            return;
        }
        if let Ok(mut capture) = self.capture.lock() {
            capture.interrupt();
        }
        self.playback.flush();
        self.playback_active = false;
        self.audio_session_open = false;
        self.forward_buf.clear();
        self.send(Outbound::ClearAudio {});
        self.state = SessionState::Paused;
        self.emit(ConversationEvent::Paused);
    }

    fn resume(&mut self) {
        if self.state != SessionState::Paused {
            return;
        }
        let text = Some(self.config.resume_command.clone());
        self.send(Outbound::interact(&self.config, text));
        self.state = SessionState::Processing;
        self.emit(ConversationEvent::Resumed);
        if let Ok(mut capture) = self.capture.lock() {
            capture.start_recording();
        }
    }

    /// Stop the conversation outright: cancel pending background work,
    /// flush both audio pipelines, close the transport.
    fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        if let Ok(mut capture) = self.capture.lock() {
            capture.interrupt();
        }
        self.playback.flush();
        self.playback_active = false;
        self.audio_session_open = false;
        self.interaction_active = false;
        self.forward_buf.clear();
        self.current_utterance = None;
        self.silence_retries = 0;
        // Dropping the outbound sender lets the writer task send the
        // closing handshake.
        self.transport = None;
        self.state = SessionState::Idle;
        self.emit(ConversationEvent::Stopped);
    }

    fn clear(&mut self) {
        self.stop();
        self.config = ConversationConfig::default();
        self.turn = 0;
    }

    fn set_configuration(&mut self, config: ConversationConfig) {
        if self.interaction_active {
            warn!("configuration change rejected mid-turn");
            return;
        }
        self.config = config;
        if self.transport.is_some() {
            self.send(Outbound::SetConfiguration {
                config: self.config.clone(),
            });
        }
    }

    fn drain_inbound(&mut self) {
        loop {
            let item = match self.transport.as_mut() {
                Some(t) => t.inbound.try_recv(),
                None => return,
            };
            match item {
                Ok(TransportItem::Message(msg)) => self.handle_inbound(msg),
                Ok(TransportItem::Closed { reason }) => {
                    let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                    self.fail(format!("transport closed: {}", reason));
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.fail("transport receiver disconnected".to_string());
                    return;
                }
            }
        }
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Authenticate => debug!("authenticated"),
            Inbound::SetConfiguration => debug!("configuration acknowledged"),
            Inbound::GetConfiguration { config } => {
                debug!("service configuration: {}", config);
            }
            Inbound::Error { error } => {
                // Server-reported faults are surfaced, never auto-retried.
                self.fail(format!("service error: {}", error));
            }
            Inbound::Interaction { event } => self.handle_interaction(event),
        }
    }

    fn handle_interaction(&mut self, event: InteractionEvent) {
        match event {
            InteractionEvent::InteractionStarted => {
                self.interaction_active = true;
                debug!("interaction started");
            }
            InteractionEvent::Text { text } => {
                self.emit(ConversationEvent::TextReceived {
                    turn: self.turn,
                    text,
                });
            }
            InteractionEvent::TextComplete => debug!("text complete"),
            InteractionEvent::Audio { audio } => self.handle_audio_fragment(&audio),
            InteractionEvent::AudioComplete => {
                self.playback.mark_end_of_stream();
            }
            InteractionEvent::Data { data } => {
                if let Some(uid) = data.get("utterance_id").and_then(|v| v.as_str()) {
                    self.current_utterance = Some(uid.to_string());
                }
                self.emit(ConversationEvent::DataReceived { data });
            }
            InteractionEvent::InteractionError { error } => {
                self.fail(format!("interaction error: {}", error));
            }
            InteractionEvent::InteractionComplete => {
                self.turn += 1;
                self.interaction_active = false;
                self.emit(ConversationEvent::TurnCompleted { turn: self.turn });
                self.playback.mark_end_of_stream();
                if !self.playback_active && self.state == SessionState::Processing {
                    // Text-only turn: nothing to render, re-arm the mic now.
                    self.arm_next_recording();
                }
            }
        }
    }

    fn handle_audio_fragment(&mut self, audio: &str) {
        let bytes = match BASE64.decode(audio) {
            Ok(b) => b,
            Err(e) => {
                warn!("undecodable audio fragment skipped: {}", e);
                return;
            }
        };
        self.emit(ConversationEvent::AudioReceived { bytes: bytes.len() });

        self.playback_active = true;
        if self.playback.push_chunk(bytes) {
            self.emit(ConversationEvent::PlaybackStarted);
            if self.state != SessionState::Paused {
                self.state = SessionState::Playing;
            }
        }
    }

    fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Spoke => {
                self.silence_retries = 0;
                if self.playback_active && self.config.allow_interrupts {
                    // Barge-in: kill the current response before any of the
                    // new turn's audio goes out, so stale audio cannot mix
                    // into the reply stream.
                    info!("barge-in: flushing playback");
                    self.playback.flush();
                    self.playback_active = false;
                    self.send(Outbound::ClearAudio {});
                    if let Some(uid) = self.current_utterance.take() {
                        self.send(Outbound::Interrupt {
                            target_uid: uid,
                            at_character: None,
                        });
                    }
                }
                self.audio_session_open = true;
                if self.state != SessionState::Paused {
                    self.state = SessionState::Recording;
                }
                self.emit(ConversationEvent::PlayerSpoke);
            }
            CaptureEvent::Silenced => {
                self.emit(ConversationEvent::MicrophoneSilenced);
                if self.config.turn_mode == TurnMode::EndTurnOnSilence {
                    // Close the turn without new text; the captured audio
                    // already streamed ahead of this.
                    self.send(Outbound::interact(&self.config, None));
                    self.interaction_active = true;
                    self.state = SessionState::Processing;
                }
            }
            CaptureEvent::SilenceTimeout => {
                self.silence_retries += 1;
                self.emit(ConversationEvent::SilenceTimeout {
                    attempt: self.silence_retries,
                });
                if self.silence_retries >= self.config.silence_retry_budget {
                    info!("silence retry budget exhausted, stopping conversation");
                    self.stop();
                } else if let Ok(mut capture) = self.capture.lock() {
                    capture.start_recording();
                }
            }
            CaptureEvent::TooLong => {
                self.emit(ConversationEvent::RecordingTooLong);
                // The service still gets a turn boundary.
                self.send(Outbound::interact(&self.config, None));
                self.interaction_active = true;
                self.state = SessionState::Processing;
            }
            CaptureEvent::EncoderFailed { reason } => {
                // Fatal only to the in-flight turn's audio; text and future
                // turns are unaffected.
                self.emit(ConversationEvent::Error {
                    reason: format!("encoder failed: {}", reason),
                });
            }
        }
    }

    /// Forward-loop step: drain encoded chunks, batch them, and terminate
    /// the per-utterance stream only once capture has stopped AND the
    /// encoder has drained AND the local backlog is empty.
    fn forward_audio(&mut self) {
        if !self.audio_session_open {
            return;
        }

        let (chunks, capture_stopped, encoder_drained) = match self.capture.lock() {
            Ok(capture) => (
                capture.drain_encoded(),
                !capture.is_capturing(),
                capture.encoder_drained(),
            ),
            Err(_) => return,
        };
        for chunk in chunks {
            self.forward_buf.extend_from_slice(&chunk);
        }

        let finishing = capture_stopped && encoder_drained;
        if self.forward_buf.len() >= FORWARD_BATCH_BYTES
            || (finishing && !self.forward_buf.is_empty())
        {
            let audio = BASE64.encode(&self.forward_buf);
            self.forward_buf.clear();
            self.send(Outbound::AddAudio {
                audio,
                config: self.wire_config.clone(),
            });
        }

        if finishing && self.forward_buf.is_empty() {
            self.audio_session_open = false;
            debug!("audio forward loop terminated for this utterance");
        }
    }

    fn check_playback(&mut self) {
        if self.playback_active && self.playback.is_drained() {
            self.playback_active = false;
            self.emit(ConversationEvent::PlaybackFinished);
            self.playback.flush();
            if self.state == SessionState::Playing {
                self.arm_next_recording();
            }
        }
    }

    fn arm_next_recording(&mut self) {
        if let Ok(mut capture) = self.capture.lock() {
            capture.start_recording();
        }
        self.state = SessionState::Recording;
    }

    fn send(&mut self, kind: Outbound) {
        let failed = match &self.transport {
            Some(t) => t.outbound.send(OutboundMessage::new(kind)).is_err(),
            None => {
                debug!("no transport, message dropped");
                false
            }
        };
        if failed {
            self.fail("transport send failed".to_string());
        }
    }

    fn fail(&mut self, reason: String) {
        warn!("conversation error: {}", reason);
        // A failed conversation has no live connection; the host decides
        // whether to start a fresh one. Capture and playback stop with it.
        self.transport = None;
        if let Ok(mut capture) = self.capture.lock() {
            capture.interrupt();
        }
        self.playback.flush();
        self.playback_active = false;
        self.audio_session_open = false;
        self.forward_buf.clear();
        self.interaction_active = false;
        self.state = SessionState::Error;
        self.emit(ConversationEvent::Error { reason });
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}
