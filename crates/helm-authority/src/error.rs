//! Authority errors

use helm_core::{ErrorKind, StationName, StationNameError};
use thiserror::Error;

use crate::AuthorityState;

/// Why a caller was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    #[error("{operation} requires SUPERVISED, station is {state}")]
    NotSupervised {
        operation: &'static str,
        state: AuthorityState,
    },

    #[error("command epoch {command} is older than current epoch {current}")]
    StaleEpoch { command: u32, current: u32 },

    #[error("command issued {age_ms} ms ago, stale after {threshold_ms} ms")]
    StaleCommand { age_ms: u64, threshold_ms: u64 },
}

/// Protocol anomalies reported by (or about) the device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    #[error("unsolicited grant while {state}")]
    UnsolicitedGrant { state: AuthorityState },

    #[error("grant epoch {granted} is older than current epoch {current}")]
    StaleGrant { granted: u32, current: u32 },
}

/// Authority manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("invalid station: {0}")]
    InvalidParameter(#[from] StationNameError),

    #[error("authority table full ({capacity} stations)")]
    Full { capacity: usize },

    #[error("station {0} is not tracked")]
    NotFound(StationName),

    #[error("station {station}: {denial}")]
    Permission { station: StationName, denial: Denial },

    #[error("station {station}: protocol anomaly: {anomaly}")]
    Protocol { station: StationName, anomaly: Anomaly },

    #[error("station {0}: handoff already in flight")]
    Busy(StationName),
}

impl AuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthorityError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            AuthorityError::Full { .. } => ErrorKind::Full,
            AuthorityError::NotFound(_) => ErrorKind::NotFound,
            AuthorityError::Permission { .. } => ErrorKind::Permission,
            AuthorityError::Protocol { .. } => ErrorKind::Protocol,
            AuthorityError::Busy(_) => ErrorKind::Busy,
        }
    }
}

/// Result type for authority operations
pub type AuthorityResult<T> = Result<T, AuthorityError>;
