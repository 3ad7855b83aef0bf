//! HELM Test Harness - Plant simulation and end-to-end validation
//!
//! This crate provides:
//! - Lossy, reordering, duplicating acyclic links
//! - Simulated field devices that fence writes by epoch
//! - A reference coordinator wiring authority and desired state together
//! - A deterministic plant simulation with invariant checking

pub mod coordinator;
pub mod link;
pub mod plant;
pub mod rtu;

pub use coordinator::*;
pub use link::*;
pub use plant::*;
pub use rtu::*;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
