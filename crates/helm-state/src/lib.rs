//! HELM State - Desired-state store and reconciliation
//!
//! This crate implements the State Reconciler:
//! - Per-station desired-state documents with a monotonic sequence
//! - CRC-32 sealed binary records, atomically persisted and restored
//! - Divergence detection against device-reported state
//! - Adoption of device state as the new desired state
//!
//! Persisted records are rejected, never repaired. A document that fails
//! its version or checksum check leaves the in-memory copy untouched.

pub mod codec;
pub mod desired;
pub mod error;
pub mod persist;
pub mod reconcile;
pub mod store;

pub use codec::*;
pub use desired::*;
pub use error::*;
pub use reconcile::*;
pub use store::*;
