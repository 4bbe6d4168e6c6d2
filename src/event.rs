use serde_json::Value;

/// Single typed event stream the host drains.
///
/// Replaces multicast callback fan-out: every observable state change of the
/// pipeline arrives here as one tagged value, so the host has no
/// subscribe/unsubscribe bookkeeping and nothing to leak.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// The conversation opened its stream and is waiting on the service.
    ProcessingStarted,
    /// Incremental text fragment of the current response.
    TextReceived { turn: u64, text: String },
    /// A compressed audio fragment arrived for the current response.
    AudioReceived { bytes: usize },
    /// Playback of a response actually started (first threshold crossing).
    PlaybackStarted,
    /// The response's audio has fully rendered (incl. output latency grace).
    PlaybackFinished,
    /// The user started speaking.
    PlayerSpoke,
    /// The user stopped speaking.
    MicrophoneSilenced,
    /// No speech arrived within the wait budget. `attempt` counts
    /// consecutive timeouts toward the retry budget.
    SilenceTimeout { attempt: u32 },
    /// The recording hit the hard duration cap and was force-stopped.
    RecordingTooLong,
    /// A turn finished (interaction_complete observed).
    TurnCompleted { turn: u64 },
    /// Structured side-channel data from the service.
    DataReceived { data: Value },
    Paused,
    Resumed,
    Stopped,
    /// Microphone permission / device failure. Blocks recording, does not
    /// kill the session.
    CaptureFailed { reason: String },
    /// Transport, protocol or codec fault surfaced to the host.
    Error { reason: String },
}
