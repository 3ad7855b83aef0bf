//! Station identity
//!
//! A station name is the field device's configured identifier. It keys both
//! engines' tables and names the device's desired-state file, so it is
//! validated once at construction and carried as a newtype afterwards.

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

use crate::ErrorKind;

/// Maximum station name length in bytes
pub const MAX_STATION_NAME_LEN: usize = 64;

/// Reasons a station name is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationNameError {
    #[error("station name is empty")]
    Empty,

    #[error("station name is {len} bytes, limit is {}", MAX_STATION_NAME_LEN)]
    TooLong { len: usize },

    #[error("station name {0:?} cannot be used as a file name")]
    NotFileSafe(String),
}

impl StationNameError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidParameter
    }
}

/// Field device identifier (case-sensitive, 1..=64 bytes)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationName(String);

impl StationName {
    pub fn new(name: impl Into<String>) -> Result<Self, StationNameError> {
        let name = name.into();

        if name.is_empty() {
            return Err(StationNameError::Empty);
        }
        if name.len() > MAX_STATION_NAME_LEN {
            return Err(StationNameError::TooLong { len: name.len() });
        }
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(StationNameError::NotFileSafe(name));
        }

        Ok(StationName(name))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<&str> for StationName {
    type Error = StationNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        StationName::new(value)
    }
}

impl TryFrom<String> for StationName {
    type Error = StationNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StationName::new(value)
    }
}

impl Borrow<str> for StationName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StationName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Station({})", self.0)
    }
}

impl fmt::Display for StationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
