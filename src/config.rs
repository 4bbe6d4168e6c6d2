use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What silence means for the current turn.
///
/// `EndTurnOnSilence` closes the turn with a neutral interact when the
/// detector reports silence. `KeepOpen` keeps the channel streaming across
/// brief silences and lets the service decide turn boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    EndTurnOnSilence,
    KeepOpen,
}

/// Value object describing one conversation. Mutable only between turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub prompt: String,
    pub temperature: f32,
    pub context: HashMap<String, String>,
    pub speakers: Vec<String>,
    pub on_input: Vec<String>,
    pub on_output: Vec<String>,
    pub audio_output: bool,
    pub allow_interrupts: bool,
    /// How many consecutive silence timeouts before the conversation is
    /// stopped outright instead of re-armed.
    pub silence_retry_budget: u32,
    /// Command text for the initial interact of a fresh conversation.
    pub start_command: String,
    /// Command text sent when resuming a paused/ongoing conversation.
    pub resume_command: String,
    #[serde(skip, default = "default_turn_mode")]
    pub turn_mode: TurnMode,
}

fn default_turn_mode() -> TurnMode {
    TurnMode::EndTurnOnSilence
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            temperature: 0.7,
            context: HashMap::new(),
            speakers: Vec::new(),
            on_input: Vec::new(),
            on_output: Vec::new(),
            audio_output: true,
            allow_interrupts: true,
            silence_retry_budget: 3,
            start_command: "start".to_string(),
            resume_command: "resume".to_string(),
            turn_mode: TurnMode::EndTurnOnSilence,
        }
    }
}

/// Tuning for one recording's lifecycle.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate of incoming microphone frames.
    pub sample_rate: u32,
    /// Hard cap on time spent in Recording before force-stop.
    pub max_speech_duration: Duration,
    /// Hard cap on time spent waiting for the first speech.
    pub max_wait_for_speech: Duration,
    /// How much pre-speech backlog survives the trim when speech starts.
    pub backlog_keep: Duration,
    /// Keep the channel open across silences (turn-taking mode).
    pub keep_open_on_silence: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_speech_duration: Duration::from_secs(30),
            max_wait_for_speech: Duration::from_secs(10),
            backlog_keep: Duration::from_secs(1),
            keep_open_on_silence: false,
        }
    }
}

/// Tuning for the playback jitter buffer.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output sample rate of the decoder.
    pub sample_rate: u32,
    /// Base byte threshold before the first decode is attempted.
    pub base_threshold: usize,
    /// Multiplier applied to the base threshold (higher = more buffering,
    /// more latency, fewer starves).
    pub buffering_level: usize,
    /// Grace period after the cursor catches up to the decoded length,
    /// compensating for output-device latency.
    pub output_latency: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            base_threshold: 4096,
            buffering_level: 1,
            output_latency: Duration::from_millis(200),
        }
    }
}
