//! The voice session coordinator.
//!
//! One [`VoiceCoordinator`] per process owns the microphone, the real-time
//! connection and the playback sink, and guarantees at most one live session.
//! Handles are cheap clones over shared state; the state itself lives behind a
//! `std::sync::Mutex` that is never held across an `.await`.

use crate::audio::capture::MicrophoneSource;
use crate::audio::playback::{AudioOutput, PlaybackSink};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::media::MediaStream;
use crate::realtime::{ConnectParams, RealtimeConnection, RealtimeProvider, SessionTarget};
use crate::session::teardown::{self, TeardownReport, TeardownStep};
use crate::token::TokenService;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capabilities the coordinator consumes.
#[derive(Clone)]
pub struct Capabilities {
    pub microphone: Arc<dyn MicrophoneSource>,
    pub tokens: Arc<dyn TokenService>,
    pub provider: Arc<dyn RealtimeProvider>,
    /// Backend for the lazily created playback sink.
    pub output: Arc<dyn AudioOutput>,
}

/// Lifecycle view derived from the coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Ending,
}

/// Coordinator lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    Starting {
        session_id: String,
    },
    Live {
        session_id: String,
        agent_id: Option<String>,
    },
    StartFailed {
        session_id: String,
        code: &'static str,
        message: String,
    },
    Ended {
        session_id: Option<String>,
        failures: usize,
    },
}

impl VoiceEvent {
    /// Wire name used by the host bridge.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "voice.starting",
            Self::Live { .. } => "voice.live",
            Self::StartFailed { .. } => "voice.start_failed",
            Self::Ended { .. } => "voice.ended",
        }
    }
}

/// Point-in-time copy of the coordinator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub phase: SessionPhase,
    pub live: bool,
    pub starting: bool,
    pub ending: bool,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub microphone_attached: bool,
    pub remote_attached: bool,
}

struct ActiveSession {
    id: String,
    /// Cancelled on teardown to retire the session's unload listener.
    retire: CancellationToken,
}

#[derive(Default)]
struct CoordinatorState {
    /// In-flight starts.
    starting: usize,
    ending: bool,
    /// Bumped by every start once its pre-clean is done; the newest start wins.
    latest_start: u64,
    connection: Option<Arc<dyn RealtimeConnection>>,
    microphone: Option<MediaStream>,
    remote: Option<MediaStream>,
    session: Option<ActiveSession>,
}

impl CoordinatorState {
    fn phase(&self) -> SessionPhase {
        if self.ending {
            SessionPhase::Ending
        } else if self.starting > 0 {
            SessionPhase::Starting
        } else if self.connection.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::Idle
        }
    }

    fn is_live(&self) -> bool {
        self.connection.is_some() || self.starting > 0
    }
}

struct Inner {
    config: SessionConfig,
    caps: Capabilities,
    state: Mutex<CoordinatorState>,
    sink: OnceLock<PlaybackSink>,
    events: broadcast::Sender<VoiceEvent>,
    unload: CancellationToken,
    teardown_done: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }
}

/// Decrements the in-flight start count on every exit path.
struct StartingGuard<'a>(&'a Inner);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.starting = state.starting.saturating_sub(1);
    }
}

/// Clears `ending` and wakes starts waiting on the teardown.
struct EndingGuard<'a>(&'a Inner);

impl Drop for EndingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().ending = false;
        self.0.teardown_done.notify_waiters();
    }
}

/// Resources one teardown claimed from the state.
struct Claimed {
    session: Option<ActiveSession>,
    microphone: Option<MediaStream>,
    remote: Option<MediaStream>,
    connection: Option<Arc<dyn RealtimeConnection>>,
}

/// What one start has acquired so far.
#[derive(Default)]
struct Acquired {
    microphone: Option<MediaStream>,
    connection: Option<Arc<dyn RealtimeConnection>>,
}

/// Shared handle to the session coordinator.
#[derive(Clone)]
pub struct VoiceCoordinator {
    inner: Arc<Inner>,
}

impl VoiceCoordinator {
    pub fn new(config: SessionConfig, caps: Capabilities) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                caps,
                state: Mutex::new(CoordinatorState::default()),
                sink: OnceLock::new(),
                events,
                unload: CancellationToken::new(),
                teardown_done: Notify::new(),
            }),
        }
    }

    /// True while a session is connected or a start is in flight.
    pub fn is_live(&self) -> bool {
        self.inner.lock().is_live()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().phase()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.inner.lock();
        StateSnapshot {
            phase: state.phase(),
            live: state.is_live(),
            starting: state.starting > 0,
            ending: state.ending,
            session_id: state.session.as_ref().map(|s| s.id.clone()),
            connection_id: state.connection.as_ref().map(|c| c.id().to_owned()),
            microphone_attached: state.microphone.is_some(),
            remote_attached: state.remote.is_some(),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events.subscribe()
    }

    /// Process-exit signal. Cancelling it tears down the live session and
    /// makes further starts fail with [`VoiceError::Unloading`].
    pub fn unload_signal(&self) -> CancellationToken {
        self.inner.unload.clone()
    }

    /// The playback sink, if a session has ever created it.
    pub fn playback_sink(&self) -> Option<&PlaybackSink> {
        self.inner.sink.get()
    }

    fn sink(&self) -> &PlaybackSink {
        self.inner.sink.get_or_init(|| {
            debug!(sink = %self.inner.config.playback_sink_id, "creating playback sink");
            PlaybackSink::new(
                self.inner.config.playback_sink_id.clone(),
                Arc::clone(&self.inner.caps.output),
            )
        })
    }

    fn emit(&self, event: VoiceEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Tear down the active session.
    ///
    /// Returns immediately with a skipped report when another teardown is
    /// already running. Never fails; step failures are collected in the
    /// returned report.
    pub async fn end_active_session(&self) -> TeardownReport {
        let claimed = {
            let mut state = self.inner.lock();
            if state.ending {
                debug!("teardown already in flight");
                return TeardownReport::skipped();
            }
            state.ending = true;
            Claimed {
                session: state.session.take(),
                microphone: state.microphone.take(),
                remote: state.remote.take(),
                connection: state.connection.clone(),
            }
        };
        let _ending = EndingGuard(&self.inner);

        let session_id = claimed.session.as_ref().map(|s| s.id.clone());
        let mut report = TeardownReport::new(session_id.clone());
        if let Some(session) = &claimed.session {
            session.retire.cancel();
        }

        report.record(TeardownStep::StopMicrophone);
        if let Some(microphone) = &claimed.microphone {
            microphone.stop_all();
        }

        report.record(TeardownStep::DetachPlayback);
        {
            let state = self.inner.lock();
            // A start that attached after the claim owns the sink now.
            if state.remote.is_none()
                && let Some(sink) = self.inner.sink.get()
            {
                sink.detach(claimed.remote.as_ref());
            }
        }

        if let Some(connection) = &claimed.connection {
            teardown::close_connection(connection, &mut report).await;
        }

        report.record(TeardownStep::ClearConnection);
        {
            let mut state = self.inner.lock();
            let ours = match (&state.connection, &claimed.connection) {
                (Some(current), Some(claimed)) => Arc::ptr_eq(current, claimed),
                _ => false,
            };
            if ours {
                state.connection = None;
            }
        }

        report.log_summary();
        self.emit(VoiceEvent::Ended {
            session_id,
            failures: report.failures.len(),
        });
        report
    }

    /// Wait until no teardown is in flight.
    async fn settle(&self) {
        loop {
            let notified = self.inner.teardown_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.lock().ending {
                return;
            }
            notified.await;
        }
    }

    /// Start a new session, tearing down any previous one first.
    ///
    /// `instructions` are only used when the token service names no agent;
    /// they default to the configured instructions.
    ///
    /// # Errors
    ///
    /// The first failing step's error, surfaced once. Capture, token,
    /// connection and stream errors map to the matching [`VoiceError`]
    /// variants; [`VoiceError::Superseded`] when a newer start took over.
    pub async fn start_session(&self, instructions: Option<&str>) -> Result<SessionHandle> {
        if self.inner.unload.is_cancelled() {
            return Err(VoiceError::Unloading);
        }

        // A skipped pre-clean means another teardown claimed the old session
        // first; wait for it instead of starting alongside it.
        loop {
            self.settle().await;
            let needs_clean = {
                let state = self.inner.lock();
                state.is_live() || state.microphone.is_some()
            };
            if !needs_clean {
                break;
            }
            info!("ending previous voice session before starting a new one");
            if !self.end_active_session().await.skipped {
                break;
            }
        }

        let epoch = {
            let mut state = self.inner.lock();
            state.starting += 1;
            state.latest_start += 1;
            state.latest_start
        };
        let _starting = StartingGuard(&self.inner);

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(session_id = %session_id, "starting voice session");
        self.emit(VoiceEvent::Starting {
            session_id: session_id.clone(),
        });

        let mut acquired = Acquired::default();
        match self
            .establish(&session_id, epoch, instructions, &mut acquired)
            .await
        {
            Ok(handle) => {
                let announced = {
                    let state = self.inner.lock();
                    let active = state.session.as_ref().is_some_and(|s| s.id == session_id);
                    // Sent under the lock so a teardown's Ended always follows.
                    if active {
                        self.emit(VoiceEvent::Live {
                            session_id: session_id.clone(),
                            agent_id: handle.agent_id().map(str::to_owned),
                        });
                    }
                    active
                };
                if announced {
                    info!(
                        session_id = %session_id,
                        agent = handle.agent_id().unwrap_or("-"),
                        "voice session live"
                    );
                } else {
                    debug!(session_id = %session_id, "session ended before its start returned");
                }
                Ok(handle)
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "voice session failed to start");
                self.emit(VoiceEvent::StartFailed {
                    session_id,
                    code: e.code(),
                    message: e.to_string(),
                });
                // A superseded start has already released what it owned.
                if !matches!(e, VoiceError::Superseded) {
                    let stale = self.inner.lock().latest_start != epoch;
                    if stale {
                        // The slots belong to a newer start; drop only our own.
                        if let Some(microphone) = &acquired.microphone {
                            self.abandon(microphone, acquired.connection.as_ref()).await;
                        }
                    } else if self.inner.config.release_capture_on_failure {
                        self.end_active_session().await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        session_id: &str,
        epoch: u64,
        instructions: Option<&str>,
        acquired: &mut Acquired,
    ) -> Result<SessionHandle> {
        let microphone = self.inner.caps.microphone.acquire().await?;
        acquired.microphone = Some(microphone.clone());
        if let Err(e) = self.install_microphone(epoch, &microphone) {
            self.abandon(&microphone, None).await;
            return Err(e);
        }

        let credential = self.inner.caps.tokens.fetch_credential().await?;

        let instructions = instructions
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.inner.config.default_instructions);
        let target = SessionTarget::resolve(&credential, instructions);
        let connection = self
            .inner
            .caps
            .provider
            .connect(ConnectParams {
                credential,
                target: target.clone(),
            })
            .await?;
        acquired.connection = Some(Arc::clone(&connection));
        debug!(
            session_id,
            connection = connection.id(),
            provider = self.inner.caps.provider.name(),
            "realtime connection established"
        );
        if let Err(e) = self.install_connection(epoch, &connection).await {
            self.abandon(&microphone, Some(&connection)).await;
            return Err(e);
        }

        connection.send_local_media(&microphone).await?;
        let remote = connection
            .remote_audio_stream()
            .await?
            .ok_or(VoiceError::NoRemoteStream)?;

        let retire = CancellationToken::new();
        let superseded = {
            let mut state = self.inner.lock();
            if state.latest_start != epoch {
                true
            } else {
                self.attach_remote(&mut state, session_id, remote, &retire);
                false
            }
        };
        if superseded {
            self.abandon(&microphone, Some(&connection)).await;
            return Err(VoiceError::Superseded);
        }

        // Opening the output device can block briefly; keep it out of the lock.
        if let Err(e) = self.sink().play() {
            debug!(error = %e, "playback did not start");
        }
        self.spawn_unload_listener(retire);

        Ok(SessionHandle {
            id: session_id.to_owned(),
            target,
            coordinator: self.clone(),
        })
    }

    /// Point the sink at `remote`, unmuted, and record the session as active.
    fn attach_remote(
        &self,
        state: &mut CoordinatorState,
        session_id: &str,
        remote: MediaStream,
        retire: &CancellationToken,
    ) {
        let sink = self.sink();
        sink.attach(remote.clone());
        sink.set_muted(false);
        state.remote = Some(remote);
        let previous = state.session.replace(ActiveSession {
            id: session_id.to_owned(),
            retire: retire.clone(),
        });
        if let Some(previous) = previous {
            previous.retire.cancel();
        }
    }

    /// Put `microphone` in its slot, stopping any stream it displaces.
    fn install_microphone(&self, epoch: u64, microphone: &MediaStream) -> Result<()> {
        let displaced = {
            let mut state = self.inner.lock();
            if state.latest_start != epoch {
                return Err(VoiceError::Superseded);
            }
            state.microphone.replace(microphone.clone())
        };
        if let Some(old) = displaced {
            warn!(stream = old.id(), "stopping microphone left by a racing start");
            old.stop_all();
        }
        Ok(())
    }

    /// Put `connection` in its slot, tearing down any connection it displaces.
    async fn install_connection(
        &self,
        epoch: u64,
        connection: &Arc<dyn RealtimeConnection>,
    ) -> Result<()> {
        let displaced = {
            let mut state = self.inner.lock();
            if state.latest_start != epoch {
                return Err(VoiceError::Superseded);
            }
            state.connection.replace(Arc::clone(connection))
        };
        if let Some(old) = displaced
            && !Arc::ptr_eq(&old, connection)
        {
            warn!(connection = old.id(), "tearing down connection left by a racing start");
            let mut report = TeardownReport::new(None);
            teardown::close_connection(&old, &mut report).await;
        }
        Ok(())
    }

    /// Release resources of a superseded start that are still its own.
    async fn abandon(
        &self,
        microphone: &MediaStream,
        connection: Option<&Arc<dyn RealtimeConnection>>,
    ) {
        {
            let mut state = self.inner.lock();
            if state
                .microphone
                .as_ref()
                .is_some_and(|m| m.same_as(microphone))
            {
                state.microphone = None;
            }
            if let (Some(current), Some(ours)) = (&state.connection, connection)
                && Arc::ptr_eq(current, ours)
            {
                state.connection = None;
            }
        }
        microphone.stop_all();
        if let Some(connection) = connection {
            let mut report = TeardownReport::new(None);
            teardown::close_connection(connection, &mut report).await;
        }
    }

    /// One-shot: end the session when the unload signal fires, unless the
    /// session is torn down first.
    fn spawn_unload_listener(&self, retire: CancellationToken) {
        let unload = self.inner.unload.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = retire.cancelled() => {}
                _ = unload.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        info!("unload signal received; ending voice session");
                        VoiceCoordinator { inner }.end_active_session().await;
                    }
                }
            }
        });
    }
}

/// Returned by a successful start.
///
/// Owns nothing: ending goes through the coordinator and tears down whatever
/// session is active at that moment.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    target: SessionTarget,
    coordinator: VoiceCoordinator,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.target {
            SessionTarget::Agent(id) => Some(id),
            SessionTarget::Instructions(_) => None,
        }
    }

    pub async fn end(&self) -> TeardownReport {
        self.coordinator.end_active_session().await
    }
}
