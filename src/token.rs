//! Token Service client.
//!
//! The backend exchanges its long-lived provider key for a short-lived
//! credential (and optionally the id of a preconfigured agent) at
//! `POST <backend>/voice/realtime/token`.

use crate::config::BackendConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Path of the token endpoint relative to the backend base URL.
pub const TOKEN_PATH: &str = "/voice/realtime/token";

/// Short-lived credential authorizing one real-time connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    /// Opaque credential handed to the provider.
    pub token: String,
    /// Preconfigured agent to talk to. When absent, instructions are sent.
    pub agent_id: Option<String>,
    /// Provider name reported by the backend (e.g. `elevenlabs`).
    pub provider: Option<String>,
    /// When the backend issued the credential.
    pub issued_at: Option<DateTime<Utc>>,
    /// Lifetime reported by the backend.
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .field("provider", &self.provider)
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl SessionCredential {
    /// Credential with only a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            agent_id: None,
            provider: None,
            issued_at: None,
            expires_in: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Expiry instant, when both issue time and lifetime are known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let issued = self.issued_at?;
        let lifetime = chrono::Duration::from_std(self.expires_in?).ok()?;
        issued.checked_add_signed(lifetime)
    }

    /// True if the credential is known to have expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }
}

/// Wire shape of the token endpoint's response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    issued_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_credential(self) -> Result<SessionCredential> {
        let token = self
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| VoiceError::InvalidToken("token response has no credential".into()))?;
        Ok(SessionCredential {
            token,
            agent_id: self.agent_id.filter(|a| !a.trim().is_empty()),
            provider: self.provider,
            issued_at: self
                .issued_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            expires_in: self.expires_in.map(Duration::from_secs),
        })
    }
}

/// Capability: obtain a short-lived credential for one real-time session.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Fetch a fresh credential.
    ///
    /// # Errors
    ///
    /// [`VoiceError::TokenExchange`] on non-2xx, [`VoiceError::Http`] on
    /// transport failure, [`VoiceError::InvalidToken`] on an unusable body.
    async fn fetch_credential(&self) -> Result<SessionCredential>;
}

/// [`TokenService`] over HTTP.
pub struct HttpTokenService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTokenService {
    /// Client for `backend_url` with no request timeout.
    pub fn new(backend_url: &str) -> Self {
        Self {
            endpoint: endpoint_for(backend_url),
            client: reqwest::Client::new(),
        }
    }

    /// Client built from configuration (environment override and timeout applied).
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the HTTP client cannot be built.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        let client = builder
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint_for(&config.effective_url()),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint_for(backend_url: &str) -> String {
    format!("{}{TOKEN_PATH}", backend_url.trim().trim_end_matches('/'))
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn fetch_credential(&self) -> Result<SessionCredential> {
        tracing::debug!(endpoint = %self.endpoint, "requesting realtime token");

        let response = self.client.post(&self.endpoint).send().await.map_err(|e| {
            tracing::error!(error = %e, "token request failed");
            VoiceError::Http(format!("token request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read body".into());
            tracing::warn!(status = %status, "token service returned error");
            return Err(VoiceError::TokenExchange {
                status: status.as_u16(),
                detail: extract_error_message(&body),
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::InvalidToken(format!("malformed token response: {e}")))?;
        let credential = parsed.into_credential()?;

        if credential.is_expired(Utc::now()) {
            tracing::warn!(
                expires_at = ?credential.expires_at(),
                "token service issued an already-expired credential"
            );
        }
        tracing::info!(
            agent = credential.agent_id.is_some(),
            provider = credential.provider.as_deref().unwrap_or("unknown"),
            "realtime token obtained"
        );
        Ok(credential)
    }
}

/// Pull a readable message out of an error body (`{"detail": ..}` or
/// `{"error": ..}`), else a truncated copy of the body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["detail", "error", "message"].iter().find_map(|key| {
                v.get(*key).and_then(|m| m.as_str()).map(String::from)
            })
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "no response body".to_string()
            } else {
                body.chars().take(300).collect()
            }
        })
}
