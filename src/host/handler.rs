//! Routes host commands onto the voice coordinator.

use crate::error::{Result, VoiceError};
use crate::host::contract::{CommandEnvelope, CommandName, EVENT_VERSION, ResponseEnvelope};
use crate::session::{SessionHandle, VoiceCoordinator};
use serde::Deserialize;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct StartPayload {
    #[serde(default)]
    instructions: Option<String>,
}

/// Command router for the voice host.
///
/// Holds the handle of the most recent successful start so `voice.hangup`
/// can end through it the way the widget does.
pub struct VoiceHost {
    coordinator: VoiceCoordinator,
    last_session: Mutex<Option<SessionHandle>>,
}

impl VoiceHost {
    pub fn new(coordinator: VoiceCoordinator) -> Self {
        Self {
            coordinator,
            last_session: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &VoiceCoordinator {
        &self.coordinator
    }

    fn take_session(&self) -> Option<SessionHandle> {
        match self.last_session.lock() {
            Ok(mut s) => s.take(),
            Err(p) => p.into_inner().take(),
        }
    }

    fn store_session(&self, handle: SessionHandle) {
        match self.last_session.lock() {
            Ok(mut s) => *s = Some(handle),
            Err(p) => *p.into_inner() = Some(handle),
        }
    }

    /// Route one command. Errors become error envelopes.
    pub async fn route(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        if let Err(e) = envelope.validate() {
            return ResponseEnvelope::failed(envelope.request_id.clone(), e.code(), e.to_string());
        }
        match self.dispatch(envelope).await {
            Ok(payload) => ResponseEnvelope::ok(envelope.request_id.clone(), payload),
            Err(e) => ResponseEnvelope::failed(envelope.request_id.clone(), e.code(), e.to_string()),
        }
    }

    async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        match envelope.command {
            CommandName::HostPing => Ok(serde_json::json!({"pong": true})),
            CommandName::HostVersion => Ok(serde_json::json!({
                "contract_version": EVENT_VERSION,
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            })),
            CommandName::VoiceStart => self.handle_start(envelope).await,
            CommandName::VoiceEnd => {
                let report = self.coordinator.end_active_session().await;
                self.take_session();
                to_value(&report)
            }
            CommandName::VoiceHangup => self.handle_hangup().await,
            CommandName::VoiceStatus => to_value(&self.coordinator.snapshot()),
            CommandName::RuntimeStop => {
                info!("runtime.stop received");
                Ok(serde_json::json!({"stopping": true}))
            }
        }
    }

    async fn handle_start(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let payload: StartPayload = if envelope.payload.is_null() {
            StartPayload::default()
        } else {
            serde_json::from_value(envelope.payload.clone())
                .map_err(|e| VoiceError::Channel(format!("invalid voice.start payload: {e}")))?
        };
        let handle = self
            .coordinator
            .start_session(payload.instructions.as_deref())
            .await?;
        let response = serde_json::json!({
            "session_id": handle.id(),
            "agent_id": handle.agent_id(),
        });
        self.store_session(handle);
        Ok(response)
    }

    /// End through the session handle, then hard end regardless.
    async fn handle_hangup(&self) -> Result<serde_json::Value> {
        let handle_report = match self.take_session() {
            Some(handle) => Some(handle.end().await),
            None => None,
        };
        let hard_report = self.coordinator.end_active_session().await;
        Ok(serde_json::json!({
            "handle": handle_report,
            "hard": hard_report,
            "live": self.coordinator.is_live(),
        }))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| VoiceError::Channel(format!("failed to serialize response: {e}")))
}
