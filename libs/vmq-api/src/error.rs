use std::fmt;

/// Client-visible error classification.
///
/// Every engine error maps onto one of these; sessions forward the kind
/// (and whether retrying makes sense) to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StoreUnavailable,
    AlreadyLeased,
    InvalidLease,
    AlreadySettled,
    UnknownTopic,
    UnknownGroup,
    NotMember,
    RebalanceInProgress,
    PartitionOffline,
    InvalidRequest,
}

impl ErrorKind {
    /// Stable snake_case name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::AlreadyLeased => "already_leased",
            ErrorKind::InvalidLease => "invalid_lease",
            ErrorKind::AlreadySettled => "already_settled",
            ErrorKind::UnknownTopic => "unknown_topic",
            ErrorKind::UnknownGroup => "unknown_group",
            ErrorKind::NotMember => "not_member",
            ErrorKind::RebalanceInProgress => "rebalance_in_progress",
            ErrorKind::PartitionOffline => "partition_offline",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }

    /// Whether the same request may succeed if simply sent again later.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::StoreUnavailable | ErrorKind::AlreadyLeased | ErrorKind::RebalanceInProgress
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The medium could not be read or written.
    Io,
    /// Persisted bytes failed validation.
    Corrupt,
    /// Backend configuration is invalid.
    Config,
    /// The backend refused the write (capacity, closed, ...).
    Unavailable,
}

/// Error returned by every storage backend method.
#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Io, message: msg.into() }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Corrupt, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Config, message: msg.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Unavailable, message: msg.into() }
    }

    /// Add context, preserving the kind. Produces `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::config(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

/// A frame that could not be turned into an operation (or an event that could
/// not be encoded). Fatal for the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol: {}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::new(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = StoreError::corrupt("bad checksum").with_context("orders/0");
        assert_eq!(err.kind, StoreErrorKind::Corrupt);
        assert_eq!(err.message, "orders/0: bad checksum");
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RebalanceInProgress.retryable());
        assert!(!ErrorKind::InvalidLease.retryable());
        assert_eq!(ErrorKind::UnknownTopic.to_string(), "unknown_topic");
    }
}
