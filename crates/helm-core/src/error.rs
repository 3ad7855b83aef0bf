//! Shared error taxonomy for HELM components
//!
//! Each engine has its own tagged error type; every variant maps onto one
//! of these kinds so a coordinator can react uniformly.

use std::fmt;

/// Error class shared by the authority and desired-state engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Argument rejected before any state was touched
    InvalidParameter,
    /// A bounded table has no room left
    Full,
    /// Station or record does not exist
    NotFound,
    /// Caller is not allowed to do this in the current state
    Permission,
    /// Peer or on-disk data violates the expected protocol
    Protocol,
    /// Filesystem failure
    Io,
    /// An operation of the same kind is already in flight
    Busy,
}

impl ErrorKind {
    /// Short, stable name used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::Full => "full",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Busy => "busy",
        }
    }

    /// Whether retrying the same call later can succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Busy | ErrorKind::Io)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
