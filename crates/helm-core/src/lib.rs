//! HELM Core - Shared primitives for the control-authority core
//!
//! This crate defines the pieces both engines agree on:
//! - Station identity (StationName)
//! - The shared error taxonomy (ErrorKind)
//! - Millisecond clocks (monotonic, wall, manual)
//! - The CRC-32 used to seal persisted records

pub mod checksum;
pub mod error;
pub mod station;
pub mod time;

pub use checksum::*;
pub use error::*;
pub use station::*;
pub use time::*;
