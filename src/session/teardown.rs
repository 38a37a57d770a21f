//! Result-collecting teardown.
//!
//! Every cleanup action is attempted regardless of what happened before it.
//! Failures (including adapter panics) are recorded in a [`TeardownReport`]
//! and logged, never propagated.

use crate::realtime::RealtimeConnection;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// One cleanup action of a session teardown, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    StopMicrophone,
    DetachPlayback,
    Disconnect,
    CloseTransport,
    ClearConnection,
}

impl TeardownStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopMicrophone => "stop_microphone",
            Self::DetachPlayback => "detach_playback",
            Self::Disconnect => "disconnect",
            Self::CloseTransport => "close_transport",
            Self::ClearConnection => "clear_connection",
        }
    }
}

impl std::fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cleanup action that failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub message: String,
}

/// Outcome of `end_active_session()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TeardownReport {
    /// Session being torn down, when one had finished starting.
    pub session_id: Option<String>,
    /// True when another teardown was already in flight and this call did
    /// nothing.
    pub skipped: bool,
    /// Steps that ran (not necessarily successfully).
    pub steps: Vec<TeardownStep>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub(crate) fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// True when every attempted step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn ran(&self, step: TeardownStep) -> bool {
        self.steps.contains(&step)
    }

    pub(crate) fn record(&mut self, step: TeardownStep) {
        self.steps.push(step);
    }

    pub(crate) fn fail(&mut self, step: TeardownStep, message: impl Into<String>) {
        let message = message.into();
        warn!(step = %step, error = %message, "teardown step failed");
        self.failures.push(TeardownFailure { step, message });
    }

    pub(crate) fn log_summary(&self) {
        if self.skipped {
            return;
        }
        info!(
            session_id = self.session_id.as_deref().unwrap_or("-"),
            steps = self.steps.len(),
            failures = self.failures.len(),
            "voice session torn down"
        );
    }
}

/// Disconnect `connection` and close its transport, recording both steps.
pub(crate) async fn close_connection(
    connection: &Arc<dyn RealtimeConnection>,
    report: &mut TeardownReport,
) {
    report.record(TeardownStep::Disconnect);
    match AssertUnwindSafe(connection.disconnect()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report.fail(TeardownStep::Disconnect, e.to_string()),
        Err(panic) => report.fail(TeardownStep::Disconnect, panic_message(panic.as_ref())),
    }

    let transport = match std::panic::catch_unwind(AssertUnwindSafe(|| connection.transport())) {
        Ok(transport) => transport,
        Err(panic) => {
            report.record(TeardownStep::CloseTransport);
            report.fail(TeardownStep::CloseTransport, panic_message(panic.as_ref()));
            return;
        }
    };
    let Some(transport) = transport else {
        return;
    };

    report.record(TeardownStep::CloseTransport);
    let closed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        for track in transport.senders().iter().chain(transport.receivers().iter()) {
            track.stop();
        }
        transport.close()
    }));
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report.fail(TeardownStep::CloseTransport, e.to_string()),
        Err(panic) => report.fail(TeardownStep::CloseTransport, panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}
