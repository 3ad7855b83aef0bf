//! Desired-state errors

use std::fmt;
use std::path::PathBuf;

use helm_core::{ErrorKind, StationName, StationNameError};
use thiserror::Error;

/// Bounded table that ran out of room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Stations,
    Actuators,
    PidLoops,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Stations => "station table",
            Table::Actuators => "actuator table",
            Table::PidLoops => "PID loop table",
        })
    }
}

/// Rejected caller input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidInput {
    #[error("slot {0} appears more than once")]
    DuplicateSlot(u16),

    #[error("loop {0} appears more than once")]
    DuplicateLoop(u16),
}

/// Something the caller asked for that does not exist
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    #[error("station {0} has no desired state")]
    Station(StationName),

    #[error("no desired-state file at {}", .0.display())]
    File(PathBuf),
}

/// Why a persisted record was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("format version {found}, expected {expected}")]
    VersionMismatch { found: u16, expected: u16 },

    #[error("checksum {stored:08x} stored, {computed:08x} computed")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("truncated: needed {needed} more bytes, {available} left")]
    Truncated { needed: usize, available: usize },

    #[error("body length {declared} declared, {actual} present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} bytes trail the record body")]
    TrailingBytes(usize),

    #[error("invalid {field} value {value}")]
    BadValue { field: &'static str, value: u8 },

    #[error("invalid station name: {0}")]
    BadStationName(StationNameError),

    #[error("record belongs to station {found}, expected {expected}")]
    StationMismatch { expected: StationName, found: StationName },

    #[error("{table} holds {count} entries, capacity is {capacity}")]
    CapacityExceeded {
        table: Table,
        count: usize,
        capacity: usize,
    },

    #[error(transparent)]
    Duplicate(#[from] InvalidInput),
}

/// Desired-state engine errors
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] InvalidInput),

    #[error("{table} full ({capacity} entries)")]
    Full { table: Table, capacity: usize },

    #[error(transparent)]
    NotFound(#[from] Missing),

    #[error("{}: record rejected: {reason}", path.display())]
    Protocol { path: PathBuf, reason: RecordError },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ReconcileError::Full { .. } => ErrorKind::Full,
            ReconcileError::NotFound(_) => ErrorKind::NotFound,
            ReconcileError::Protocol { .. } => ErrorKind::Protocol,
            ReconcileError::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Result type for desired-state operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;
