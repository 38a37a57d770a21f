//! Voice session lifecycle.

pub mod coordinator;
pub mod teardown;

pub use coordinator::{
    Capabilities, SessionHandle, SessionPhase, StateSnapshot, VoiceCoordinator, VoiceEvent,
};
pub use teardown::{TeardownFailure, TeardownReport, TeardownStep};
