//! Stdin/stdout JSON bridge for the voice host.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages, routes them
//! through [`VoiceHost`], and writes `ResponseEnvelope` and `EventEnvelope`
//! messages as newline-delimited JSON.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, VoiceError};
use crate::host::contract::{
    CommandEnvelope, CommandName, ContractError, EventEnvelope, PARSE_ERROR_ID, ResponseEnvelope,
};
use crate::host::handler::VoiceHost;
use crate::session::{VoiceCoordinator, VoiceEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinSet;

/// How long in-flight commands may run after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type SharedWriter<W> = Arc<Mutex<W>>;

/// Run the bridge over the process's stdin/stdout.
pub async fn run_stdio_bridge(coordinator: VoiceCoordinator) -> Result<()> {
    run_bridge(coordinator, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the bridge until `input` closes, `runtime.stop` is received or the
/// coordinator's unload signal fires.
///
/// Commands are dispatched concurrently so a hang-up can overtake a start
/// that is still waiting on the network; responses carry the request id.
/// On exit the coordinator's unload signal fires and a final teardown runs
/// before this returns.
pub async fn run_bridge<R, W>(coordinator: VoiceCoordinator, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(output));
    let host = Arc::new(VoiceHost::new(coordinator.clone()));

    let event_handle = tokio::spawn(forward_events(coordinator.subscribe(), Arc::clone(&writer)));

    let mut in_flight = JoinSet::new();
    let reader_result = run_reader(input, &host, &writer, &mut in_flight).await;

    coordinator.unload_signal().cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("in-flight commands did not finish; aborting");
        in_flight.abort_all();
    }
    let report = coordinator.end_active_session().await;
    if !report.is_clean() {
        tracing::warn!(failures = report.failures.len(), "final teardown had failures");
    }

    // Let the Ended event reach the writer before stopping the forwarder.
    tokio::task::yield_now().await;
    event_handle.abort();
    let _ = event_handle.await;
    writer.lock().await.flush().await?;

    reader_result
}

async fn run_reader<R, W>(
    input: R,
    host: &Arc<VoiceHost>,
    writer: &SharedWriter<W>,
    in_flight: &mut JoinSet<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();
    let unload = host.coordinator().unload_signal();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            _ = unload.cancelled() => {
                tracing::info!("unload signal fired; shutting down voice bridge");
                break;
            }
            read = reader.read_line(&mut line) => read
                .map_err(|e| VoiceError::Channel(format!("failed to read from stdin: {e}")))?,
        };

        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down voice bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let err = ContractError::Parse(e.to_string());
                let response = ResponseEnvelope::failed(PARSE_ERROR_ID, err.code(), err.to_string());
                write_json(writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::RuntimeStop {
            let response = host.route(&envelope).await;
            write_json(writer, &response).await?;
            tracing::info!("runtime.stop received; shutting down voice bridge");
            break;
        }

        let host = Arc::clone(host);
        let writer = Arc::clone(writer);
        in_flight.spawn(async move {
            let response = host.route(&envelope).await;
            if let Err(e) = write_json(&writer, &response).await {
                tracing::warn!(error = %e, "failed to write response envelope");
            }
        });
        // Reap finished commands so the set does not grow unbounded.
        while in_flight.try_join_next().is_some() {}
    }

    Ok(())
}

async fn forward_events<W>(mut events: broadcast::Receiver<VoiceEvent>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let envelope = match EventEnvelope::from_voice_event(&event) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize voice event; skipping");
                        continue;
                    }
                };
                if let Err(e) = write_json(&writer, &envelope).await {
                    tracing::warn!(error = %e, "failed to write event envelope; stopping forwarder");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Serialize `value` and write it as a single line, then flush.
async fn write_json<W, T>(writer: &SharedWriter<W>, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut json = serde_json::to_string(value)
        .map_err(|e| VoiceError::Channel(format!("failed to serialize envelope: {e}")))?;
    json.push('\n');
    let mut w = writer.lock().await;
    w.write_all(json.as_bytes())
        .await
        .map_err(|e| VoiceError::Channel(format!("failed to write to stdout: {e}")))?;
    w.flush()
        .await
        .map_err(|e| VoiceError::Channel(format!("failed to flush stdout: {e}")))?;
    Ok(())
}
