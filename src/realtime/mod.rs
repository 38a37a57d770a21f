//! Real-time connection provider contract.
//!
//! The coordinator never probes a provider object for whichever teardown
//! method it happens to expose. Each provider is wrapped once in an adapter
//! implementing [`RealtimeConnection`], whose only mandatory operation is
//! [`RealtimeConnection::disconnect`]. Everything else is optional with a
//! default that reports the capability as missing.

pub mod websocket;

use crate::error::{Result, VoiceError};
use crate::media::{MediaStream, MediaTrack};
use crate::token::SessionCredential;
use async_trait::async_trait;
use std::sync::Arc;

/// Who the connection should talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// A preconfigured agent named by the token service.
    Agent(String),
    /// An ad-hoc agent driven by natural-language instructions.
    Instructions(String),
}

impl SessionTarget {
    /// Prefer the credential's agent; fall back to `instructions`.
    pub fn resolve(credential: &SessionCredential, instructions: &str) -> Self {
        match credential.agent_id.as_deref() {
            Some(agent) => Self::Agent(agent.to_owned()),
            None => Self::Instructions(instructions.to_owned()),
        }
    }
}

/// Everything a provider needs to establish one connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub credential: SessionCredential,
    pub target: SessionTarget,
}

/// Factory for real-time connections.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    /// Stable provider identifier (e.g. `websocket`).
    fn name(&self) -> &str;

    /// Establish a connection.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Connection`] when the connection cannot be set up.
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn RealtimeConnection>>;
}

/// One live bidirectional audio connection.
#[async_trait]
pub trait RealtimeConnection: Send + Sync {
    /// Stable identifier for logs.
    fn id(&self) -> &str;

    /// Send the local microphone stream to the remote side.
    async fn send_local_media(&self, _stream: &MediaStream) -> Result<()> {
        Err(VoiceError::CapabilityMissing("send_local_media"))
    }

    /// The remote side's audio, if the connection produces one.
    async fn remote_audio_stream(&self) -> Result<Option<MediaStream>> {
        Ok(None)
    }

    /// End the conversation and release provider-side resources.
    ///
    /// Adapters map this onto whatever their provider calls it (end, leave,
    /// close, destroy...). Must tolerate being called on an already-closed
    /// connection.
    async fn disconnect(&self) -> Result<()>;

    /// Underlying media transport, when the adapter exposes it.
    fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        None
    }
}

/// Low-level transport beneath a connection.
pub trait MediaTransport: Send + Sync {
    /// Outbound tracks.
    fn senders(&self) -> Vec<MediaTrack>;

    /// Inbound tracks.
    fn receivers(&self) -> Vec<MediaTrack>;

    /// Close the transport. Must be idempotent.
    fn close(&self) -> Result<()>;
}
