//! Host-facing command bridge standing in for the UI layer.

pub mod contract;
pub mod handler;
pub mod stdio;
