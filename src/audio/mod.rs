//! Microphone capture and remote audio playback via cpal.

pub mod capture;
pub mod playback;
