//! Error types for the voice session coordinator.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`VoiceError::code()`].
//! Hosts should match on codes rather than parse messages.

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Microphone denied or unavailable.
    pub const CAPTURE_FAILED: &str = "CAPTURE_FAILED";

    /// Token service answered with a non-success status.
    pub const TOKEN_EXCHANGE_FAILED: &str = "TOKEN_EXCHANGE_FAILED";

    /// Token service answered 2xx but the body was unusable.
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";

    /// Transport-level HTTP failure (DNS, refused, timeout).
    pub const HTTP_FAILED: &str = "HTTP_FAILED";

    /// Real-time connection could not be established.
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";

    /// Provider connection lacks an operation the coordinator needs.
    pub const CAPABILITY_MISSING: &str = "CAPABILITY_MISSING";

    /// Provider connection produced no remote audio stream.
    pub const NO_REMOTE_STREAM: &str = "NO_REMOTE_STREAM";

    /// A newer start began before this one finished.
    pub const START_SUPERSEDED: &str = "START_SUPERSEDED";

    /// Coordinator has been unloaded and accepts no new sessions.
    pub const UNLOADING: &str = "UNLOADING";

    /// Playback sink or output device failure.
    pub const PLAYBACK_FAILED: &str = "PLAYBACK_FAILED";

    /// Invalid or unreadable configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// I/O failure.
    pub const IO_ERROR: &str = "IO_ERROR";

    /// Internal channel closed or full.
    pub const CHANNEL_ERROR: &str = "CHANNEL_ERROR";
}

/// Top-level error type for the voice subsystem.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone denied or unavailable.
    #[error("[{code}] capture denied/unavailable: {0}", code = error_codes::CAPTURE_FAILED)]
    Capture(String),

    /// Token service returned a non-2xx status.
    #[error(
        "[{code}] token exchange failed: HTTP {status}: {detail}",
        code = error_codes::TOKEN_EXCHANGE_FAILED
    )]
    TokenExchange { status: u16, detail: String },

    /// Token service body could not be used as a credential.
    #[error("[{code}] {0}", code = error_codes::TOKEN_INVALID)]
    InvalidToken(String),

    /// Transport error while talking to the token service.
    #[error("[{code}] {0}", code = error_codes::HTTP_FAILED)]
    Http(String),

    /// Provider failed to establish the real-time connection.
    #[error("[{code}] {0}", code = error_codes::CONNECTION_FAILED)]
    Connection(String),

    /// Provider connection does not support a required operation.
    #[error("[{code}] connection does not support {0}", code = error_codes::CAPABILITY_MISSING)]
    CapabilityMissing(&'static str),

    /// Provider connection has no remote audio stream.
    #[error("[{code}] no remote audio stream", code = error_codes::NO_REMOTE_STREAM)]
    NoRemoteStream,

    /// A newer `start_session` call took over while this one was in flight.
    #[error("[{code}] start superseded by a newer start", code = error_codes::START_SUPERSEDED)]
    Superseded,

    /// The unload signal has fired.
    #[error("[{code}] coordinator is unloading", code = error_codes::UNLOADING)]
    Unloading,

    /// Audio output failure.
    #[error("[{code}] {0}", code = error_codes::PLAYBACK_FAILED)]
    Playback(String),

    /// Configuration error.
    #[error("[{code}] {0}", code = error_codes::CONFIG_INVALID)]
    Config(String),

    /// I/O error.
    #[error("[{code}] {0}", code = error_codes::IO_ERROR)]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("[{code}] {0}", code = error_codes::CHANNEL_ERROR)]
    Channel(String),
}

impl VoiceError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Capture(_) => error_codes::CAPTURE_FAILED,
            Self::TokenExchange { .. } => error_codes::TOKEN_EXCHANGE_FAILED,
            Self::InvalidToken(_) => error_codes::TOKEN_INVALID,
            Self::Http(_) => error_codes::HTTP_FAILED,
            Self::Connection(_) => error_codes::CONNECTION_FAILED,
            Self::CapabilityMissing(_) => error_codes::CAPABILITY_MISSING,
            Self::NoRemoteStream => error_codes::NO_REMOTE_STREAM,
            Self::Superseded => error_codes::START_SUPERSEDED,
            Self::Unloading => error_codes::UNLOADING,
            Self::Playback(_) => error_codes::PLAYBACK_FAILED,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Io(_) => error_codes::IO_ERROR,
            Self::Channel(_) => error_codes::CHANNEL_ERROR,
        }
    }

    /// HTTP status carried by a token exchange failure, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::TokenExchange { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
