//! WebSocket adapter for the conversational agent service.
//!
//! Protocol (JSON text frames):
//!
//! ```text
//! client → conversation_initiation_client_data   (once, carries the prompt override)
//! client → {"user_audio_chunk": "<base64 pcm16>"} (microphone audio)
//! server → {"type": "audio", "audio_event": {"audio_base_64": ..}}
//! server → {"type": "ping", "ping_event": {"event_id": n}}  → client pong
//! ```
//!
//! Two background tasks own the socket halves. Everything user-facing goes
//! through an outbound queue, so `disconnect()` only has to cancel one token.

use crate::config::RealtimeConfig;
use crate::error::{Result, VoiceError};
use crate::media::{AudioChunk, MediaStream, MediaTrack};
use crate::realtime::{ConnectParams, MediaTransport, RealtimeConnection, RealtimeProvider, SessionTarget};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the short-lived credential.
const AUTH_HEADER: &str = "xi-api-key";

/// Server events we act on. Unknown event types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    Audio {
        audio_event: AudioEvent,
    },
    Ping {
        ping_event: PingEvent,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AudioEvent {
    audio_base_64: String,
}

#[derive(Debug, Deserialize)]
struct PingEvent {
    event_id: u64,
}

/// [`RealtimeProvider`] speaking the conversational agent WebSocket protocol.
pub struct WebSocketProvider {
    config: RealtimeConfig,
}

impl WebSocketProvider {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

/// Build the connection URL, adding `agent_id` for agent targets.
fn connection_url(base: &str, target: &SessionTarget) -> Result<url::Url> {
    let mut url = url::Url::parse(base)
        .map_err(|e| VoiceError::Connection(format!("invalid realtime URL '{base}': {e}")))?;
    if let SessionTarget::Agent(agent) = target {
        url.query_pairs_mut().append_pair("agent_id", agent);
    }
    Ok(url)
}

/// First message sent after the socket opens.
fn initiation_message(target: &SessionTarget) -> String {
    let body = match target {
        SessionTarget::Agent(_) => serde_json::json!({
            "type": "conversation_initiation_client_data",
        }),
        SessionTarget::Instructions(text) => serde_json::json!({
            "type": "conversation_initiation_client_data",
            "conversation_config_override": {
                "agent": { "prompt": { "prompt": text } }
            }
        }),
    };
    body.to_string()
}

/// Encode f32 samples as base64 little-endian PCM16.
pub(crate) fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode base64 little-endian PCM16 into f32 samples.
pub(crate) fn decode_pcm16(encoded: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| VoiceError::Connection(format!("invalid audio payload: {e}")))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect())
}

#[async_trait]
impl RealtimeProvider for WebSocketProvider {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn RealtimeConnection>> {
        let url = connection_url(&self.config.ws_url, &params.target)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connection(format!("invalid realtime request: {e}")))?;
        let auth = HeaderValue::from_str(&params.credential.token)
            .map_err(|e| VoiceError::Connection(format!("credential is not a valid header: {e}")))?;
        request.headers_mut().insert(AUTH_HEADER, auth);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoiceError::Connection(format!("connect: {e}")))?;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(initiation_message(&params.target)))
            .await
            .map_err(|e| VoiceError::Connection(format!("send initiation: {e}")))?;

        let id = format!("ws-{}", uuid::Uuid::new_v4());
        let closed = CancellationToken::new();
        let (out_tx, mut out_rx) =
            mpsc::channel::<String>(self.config.outbound_queue_messages.max(1));
        let (remote, remote_tx) =
            MediaStream::audio_channel(format!("{id}-remote"), self.config.remote_queue_chunks);
        let remote_rate = self.config.remote_sample_rate;

        // Writer: drains the outbound queue, sends Close on cancellation.
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = out_rx.recv() => match msg {
                        Some(json) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!(error = %e, "realtime socket send failed");
                                writer_closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: routes agent audio to the remote stream, answers pings.
        let reader_closed = closed.clone();
        let reader_out = out_tx.clone();
        let reader_remote = remote.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_server_text(&text, &remote_tx, &reader_out, remote_rate);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("realtime socket closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "realtime socket read error");
                            break;
                        }
                        _ => {}
                    },
                }
            }
            reader_closed.cancel();
            reader_remote.stop_all();
        });

        let transport = Arc::new(SocketTransport {
            senders: Mutex::new(Vec::new()),
            receivers: remote.tracks().to_vec(),
            closed: closed.clone(),
        });

        info!(connection = %id, "realtime connection established");
        Ok(Arc::new(WebSocketConnection {
            id,
            out_tx,
            remote,
            closed,
            transport,
        }))
    }
}

fn handle_server_text(
    text: &str,
    remote_tx: &mpsc::Sender<AudioChunk>,
    out_tx: &mpsc::Sender<String>,
    sample_rate: u32,
) {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "ignoring unparsable realtime event");
            return;
        }
    };
    match event {
        ServerEvent::Audio { audio_event } => match decode_pcm16(&audio_event.audio_base_64) {
            Ok(samples) => {
                let chunk = AudioChunk {
                    samples,
                    sample_rate,
                    captured_at: Instant::now(),
                };
                if remote_tx.try_send(chunk).is_err() {
                    debug!("remote audio channel full, dropping chunk");
                }
            }
            Err(e) => debug!(error = %e, "dropping undecodable audio event"),
        },
        ServerEvent::Ping { ping_event } => {
            let pong = serde_json::json!({ "type": "pong", "event_id": ping_event.event_id });
            queue_outbound(out_tx, pong.to_string());
        }
        ServerEvent::Other => {}
    }
}

/// Queue `msg` for the socket writer without waiting. Returns false once the
/// writer is gone.
fn queue_outbound(out_tx: &mpsc::Sender<String>, msg: String) -> bool {
    match out_tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("outbound socket queue full, dropping message");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// One conversational agent connection.
pub struct WebSocketConnection {
    id: String,
    out_tx: mpsc::Sender<String>,
    remote: MediaStream,
    closed: CancellationToken,
    transport: Arc<SocketTransport>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_local_media(&self, stream: &MediaStream) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(VoiceError::Connection("connection already closed".into()));
        }
        let mut rx = stream
            .take_audio()
            .ok_or_else(|| VoiceError::Connection("local stream audio already consumed".into()))?;

        if let Ok(mut senders) = self.transport.senders.lock() {
            senders.extend(stream.tracks().iter().cloned());
        }

        let out_tx = self.out_tx.clone();
        let closed = self.closed.clone();
        let stopped = stream.stopped();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = stopped.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => {
                            let msg = serde_json::json!({
                                "user_audio_chunk": encode_pcm16(&chunk.samples),
                            });
                            if !queue_outbound(&out_tx, msg.to_string()) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("microphone pump finished");
        });
        Ok(())
    }

    async fn remote_audio_stream(&self) -> Result<Option<MediaStream>> {
        Ok(Some(self.remote.clone()))
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            info!(connection = %self.id, "closing realtime connection");
        }
        self.closed.cancel();
        Ok(())
    }

    fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        Some(self.transport.clone())
    }
}

struct SocketTransport {
    senders: Mutex<Vec<MediaTrack>>,
    receivers: Vec<MediaTrack>,
    closed: CancellationToken,
}

impl MediaTransport for SocketTransport {
    fn senders(&self) -> Vec<MediaTrack> {
        match self.senders.lock() {
            Ok(s) => s.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn receivers(&self) -> Vec<MediaTrack> {
        self.receivers.clone()
    }

    fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
