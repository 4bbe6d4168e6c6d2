use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ConversationConfig;

/// One outbound wire message: unique id, client timestamp, type-tagged body.
/// The connection is one ordered log per session; nothing correlates by id.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: Outbound,
}

impl OutboundMessage {
    pub fn new(kind: Outbound) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            kind,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Authenticate {
        access_token: String,
    },
    SetConfiguration {
        config: ConversationConfig,
    },
    GetConfiguration {},
    Interact {
        /// Stream-typed: the response arrives as interaction events.
        kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        speakers: Vec<String>,
        context: std::collections::HashMap<String, String>,
        on_input: Vec<String>,
        on_output: Vec<String>,
        audio_output: bool,
    },
    AddAudio {
        /// Base64 codec pages.
        audio: String,
        config: AudioWireConfig,
    },
    ClearAudio {},
    Interrupt {
        target_uid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        at_character: Option<u64>,
    },
}

impl Outbound {
    /// Interact message built from the session configuration. `text: None`
    /// is the neutral turn-closing interact.
    pub fn interact(config: &ConversationConfig, text: Option<String>) -> Self {
        Outbound::Interact {
            kind: "stream".to_string(),
            text,
            speakers: config.speakers.clone(),
            context: config.context.clone(),
            on_input: config.on_input.clone(),
            on_output: config.on_output.clone(),
            audio_output: config.audio_output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioWireConfig {
    pub sample_rate: u32,
    pub mime_type: String,
}

/// Inbound messages, discriminated by `type`, then by the nested `event`
/// for streamed interaction responses.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Authenticate,
    Error {
        error: String,
    },
    SetConfiguration,
    GetConfiguration {
        config: Value,
    },
    Interaction {
        #[serde(flatten)]
        event: InteractionEvent,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InteractionEvent {
    InteractionStarted,
    Text { text: String },
    TextComplete,
    Audio { audio: String },
    AudioComplete,
    Data { data: Value },
    InteractionError { error: String },
    InteractionComplete,
}
