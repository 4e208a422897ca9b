use std::fmt;

/// Machine-readable error codes surfaced to the UI layer and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    EmptyIdentifier,
    MissingParent,
    RowNotFound,
    StoreWriteFailed,
    StoreCorrupt,
    GatewayUnreachable,
    GatewayRejected,
    GatewayTimeout,
    GatewayMissingId,
    JournalWriteFailed,
    JournalCorrupt,
    LockContention,
    WorkerStopped,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::EmptyIdentifier => "E2001",
            Self::MissingParent => "E2002",
            Self::RowNotFound => "E2003",
            Self::StoreWriteFailed => "E3001",
            Self::StoreCorrupt => "E3002",
            Self::GatewayUnreachable => "E4001",
            Self::GatewayRejected => "E4002",
            Self::GatewayTimeout => "E4003",
            Self::GatewayMissingId => "E4004",
            Self::JournalWriteFailed => "E5001",
            Self::JournalCorrupt => "E5002",
            Self::LockContention => "E5003",
            Self::WorkerStopped => "E6001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and banners.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::EmptyIdentifier => "Empty entity identifier",
            Self::MissingParent => "Parent entity does not exist locally",
            Self::RowNotFound => "Row not found",
            Self::StoreWriteFailed => "Local store write failed",
            Self::StoreCorrupt => "Local store row could not be decoded",
            Self::GatewayUnreachable => "Server unreachable",
            Self::GatewayRejected => "Server rejected the change",
            Self::GatewayTimeout => "Server call timed out",
            Self::GatewayMissingId => "Server response carried no identifier",
            Self::JournalWriteFailed => "Queue journal write failed",
            Self::JournalCorrupt => "Queue journal could not be decoded",
            Self::LockContention => "Queue journal is locked by another session",
            Self::WorkerStopped => "Sync worker is not running",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to users.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .revsync/config.toml and retry."),
            Self::EmptyIdentifier | Self::RowNotFound => None,
            Self::MissingParent => Some("Create the parent entity before adding children to it."),
            Self::StoreWriteFailed => Some("Check disk space and write permissions."),
            Self::StoreCorrupt => Some("Reload data from the server to rebuild the local store."),
            Self::GatewayUnreachable | Self::GatewayTimeout => {
                Some("Changes stay queued locally; they are sent once the connection returns.")
            }
            Self::GatewayRejected => Some("The local change was rolled back. Review and retry."),
            Self::GatewayMissingId => Some("Check that the server API version matches the client."),
            Self::JournalWriteFailed => Some("Check disk space; queued changes may not survive a reload."),
            Self::JournalCorrupt => Some("Remove the journal file; unsent changes will be lost."),
            Self::LockContention => Some("Close the other session that is syncing this workspace."),
            Self::WorkerStopped => Some("Restart the sync worker."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
