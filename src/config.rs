//! Configuration types for the voice session coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that overrides [`BackendConfig::url`].
pub const BACKEND_URL_ENV: &str = "PLATE_VOICE_BACKEND_URL";

/// Instructions sent to the agent when the token service names no agent.
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a friendly nutrition coach. Ask one clarifying question and include macros.";

/// Well-known identifier of the shared playback sink.
pub const DEFAULT_PLAYBACK_SINK_ID: &str = "voice-agent-audio";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Token service location.
    pub backend: BackendConfig,
    /// Session behaviour.
    pub session: SessionConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Real-time provider settings.
    pub realtime: RealtimeConfig,
}

/// Token service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend exposing `/voice/realtime/token`.
    pub url: String,
    /// Request timeout in seconds for the token exchange (0 = no timeout).
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_owned(),
            request_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    /// Backend URL with the environment override applied and any trailing
    /// slash removed.
    pub fn effective_url(&self) -> String {
        let raw = std::env::var(BACKEND_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.url.clone());
        raw.trim().trim_end_matches('/').to_owned()
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Instructions used when neither the caller nor the token service
    /// supplies an agent.
    pub default_instructions: String,
    /// Identifier of the shared playback sink.
    pub playback_sink_id: String,
    /// Tear down whatever a failed start attached before returning the error.
    ///
    /// Off by default: a failed start leaves the capture attached until the
    /// caller ends the session explicitly.
    pub release_capture_on_failure: bool,
    /// Capacity of the coordinator event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_instructions: DEFAULT_INSTRUCTIONS.to_owned(),
            playback_sink_id: DEFAULT_PLAYBACK_SINK_ID.to_owned(),
            release_capture_on_failure: false,
            event_capacity: 64,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate delivered to the connection, in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Capacity (in chunks) of the capture channel.
    pub capture_queue_chunks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 16_000,
            input_device: None,
            output_device: None,
            capture_queue_chunks: 64,
        }
    }
}

/// Real-time provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the conversational agent service.
    pub ws_url: String,
    /// Sample rate of the agent's PCM16 output, in Hz.
    pub remote_sample_rate: u32,
    /// Capacity (in chunks) of the remote audio channel.
    pub remote_queue_chunks: usize,
    /// Capacity (in messages) of the outbound socket queue. Microphone
    /// chunks beyond it are dropped while the socket is backed up.
    pub outbound_queue_messages: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.elevenlabs.io/v1/convai/conversation".to_owned(),
            remote_sample_rate: 16_000,
            remote_queue_chunks: 256,
            outbound_queue_messages: 64,
        }
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::VoiceError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/plate-voice/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("plate-voice").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("plate-voice").join("config.toml")
        } else {
            PathBuf::from("/tmp/plate-voice-config/config.toml")
        }
    }
}
