//! Wire envelopes for the voice host bridge (contract v1).
//!
//! Frontend → host: one [`CommandEnvelope`] per line. Host → frontend: one
//! [`ResponseEnvelope`] per command, correlated by `request_id`, plus an
//! [`EventEnvelope`] for every coordinator [`VoiceEvent`].

use crate::session::VoiceEvent;
use serde::{Deserialize, Serialize};

pub const EVENT_VERSION: u32 = 1;

/// Request id of the response to a line that could not be parsed.
pub const PARSE_ERROR_ID: &str = "parse-error";

/// Commands the voice host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "host.version")]
    HostVersion,
    /// Payload: `{"instructions": "..."}`, optional.
    #[serde(rename = "voice.start")]
    VoiceStart,
    #[serde(rename = "voice.end")]
    VoiceEnd,
    /// Escape-key hang-up: end through the session handle, then hard end.
    #[serde(rename = "voice.hangup")]
    VoiceHangup,
    #[serde(rename = "voice.status")]
    VoiceStatus,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Reject other contract versions and blank request ids.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::UnsupportedVersion { found: self.v });
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::EmptyRequestId);
        }
        Ok(())
    }
}

/// Outcome of one command. Failures carry the error's stable code so hosts
/// can branch without parsing `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            code: None,
            error: None,
        }
    }

    pub fn failed(
        request_id: impl Into<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            code: Some(code.to_owned()),
            error: Some(message.into()),
        }
    }
}

/// A coordinator event as sent to the frontend, e.g. `voice.live`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap `event` under a fresh event id.
    pub fn from_voice_event(event: &VoiceEvent) -> serde_json::Result<Self> {
        Ok(Self {
            v: EVENT_VERSION,
            event_id: uuid::Uuid::new_v4().to_string(),
            event: event.name().to_owned(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// A command line the bridge refuses before routing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("[PARSE_ERROR] failed to parse command envelope: {0}")]
    Parse(String),

    #[error("[UNSUPPORTED_VERSION] contract version {found} is not supported; expected {}", EVENT_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("[INVALID_ENVELOPE] request_id cannot be empty")]
    EmptyRequestId,
}

impl ContractError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            Self::EmptyRequestId => "INVALID_ENVELOPE",
        }
    }
}
