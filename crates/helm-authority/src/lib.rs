//! HELM Authority - Who may drive a field device's outputs
//!
//! This crate implements the Authority Manager:
//! - Per-station handoff state machine (AUTONOMOUS, HANDOFF_PENDING,
//!   SUPERVISED, RELEASING)
//! - Epoch tracking across ownership periods
//! - Command admission against the current epoch
//! - Poll-driven timeout sweep that always fails toward device control
//!
//! The manager never talks to a device. A coordinator feeds it connection
//! events and protocol messages, and consults it before issuing writes.

pub mod context;
pub mod error;
pub mod manager;

pub use context::*;
pub use error::*;
pub use manager::*;
