//! Plate voice: real-time voice session coordinator.
//!
//! One [`VoiceCoordinator`] owns a microphone capture, a credential exchange,
//! a real-time audio connection and a reusable playback sink, and guarantees
//! that at most one session is live at a time:
//!
//! Microphone → Token service → Real-time connection → Playback sink
//!
//! # Architecture
//!
//! - **Audio capture**: records from the microphone via `cpal`
//! - **Token**: exchanges the backend's key for a short-lived credential
//! - **Realtime**: provider adapters with a fixed `disconnect()` contract
//! - **Playback**: a single lazily created sink rendering remote audio via `cpal`
//! - **Session**: start/teardown coordination with a result-collecting teardown
//! - **Host**: newline-delimited JSON bridge over stdin/stdout

pub mod audio;
pub mod config;
pub mod error;
pub mod host;
pub mod media;
pub mod realtime;
pub mod session;
pub mod token;

pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use session::{SessionHandle, SessionPhase, TeardownReport, VoiceCoordinator, VoiceEvent};
