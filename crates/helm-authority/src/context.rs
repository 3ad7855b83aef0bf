//! Per-station authority context and the handoff state machine

use std::fmt;

use helm_core::{Millis, StationName};

/// Who is driving a station's outputs
///
/// ```text
/// AUTONOMOUS -> HANDOFF_PENDING -> SUPERVISED -> RELEASING -> AUTONOMOUS
/// ```
///
/// Any state may fall back to AUTONOMOUS (device release, timeout, forced
/// release). A re-request during RELEASING restarts the handoff. There is no
/// edge from AUTONOMOUS straight to SUPERVISED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AuthorityState {
    /// Device self-governs
    #[default]
    Autonomous = 0,
    /// Controller asked for control, waiting on the device's grant
    HandoffPending = 1,
    /// Controller has control
    Supervised = 2,
    /// Controller is handing control back
    Releasing = 3,
}

impl AuthorityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityState::Autonomous => "AUTONOMOUS",
            AuthorityState::HandoffPending => "HANDOFF_PENDING",
            AuthorityState::Supervised => "SUPERVISED",
            AuthorityState::Releasing => "RELEASING",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(self, next: AuthorityState) -> bool {
        use AuthorityState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Autonomous) => true,
            (Autonomous, HandoffPending) | (Releasing, HandoffPending) => true,
            (HandoffPending, Supervised) => true,
            (Supervised, Releasing) => true,
            _ => false,
        }
    }

    /// Whether the controller may be driving outputs in this state
    #[inline]
    pub fn controller_drives(self) -> bool {
        self == AuthorityState::Supervised
    }
}

impl fmt::Display for AuthorityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority bookkeeping for one station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityContext {
    /// Ownership period counter, starts at 1, never decreases
    pub epoch: u32,
    pub state: AuthorityState,
    /// Start of the current handoff or release phase
    pub request_time: Millis,
    pub grant_time: Millis,
    /// Controller identity while supervised, station name otherwise
    pub holder: String,
    pub controller_online: bool,
    pub rtu_acknowledged: bool,
    pub stale_command_threshold_ms: u64,
}

impl AuthorityContext {
    /// Fresh context: device autonomous at epoch 1
    pub fn new(station: &StationName, stale_command_threshold_ms: u64) -> Self {
        AuthorityContext {
            epoch: 1,
            state: AuthorityState::Autonomous,
            request_time: 0,
            grant_time: 0,
            holder: station.to_string(),
            controller_online: false,
            rtu_acknowledged: false,
            stale_command_threshold_ms,
        }
    }

    /// Adopt an epoch reported by the device without moving backwards
    #[inline]
    pub(crate) fn adopt_epoch(&mut self, epoch: u32) {
        self.epoch = self.epoch.max(epoch);
    }

    #[inline]
    pub(crate) fn bump_epoch(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
    }
}
