//! Error types for Keystead
//!
//! Every fault raised by a guard or handler ends up here. Only the
//! `Display` text crosses the RPC boundary.

/// Main error type for wallet operations
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// Wrong password or failed integrity check
    #[error("{0}")]
    Authentication(String),

    /// Operation required the Unlocked state
    #[error("Keystead is locked")]
    Locked,

    /// Backup manifest unparsable or missing a reserved key
    #[error("Backup file is corrupted: {0}")]
    CorruptedBackup(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// User rejected a consent request (explicitly or by closing the surface)
    #[error("{0}")]
    Rejected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Stable short name for log fields. Never sent to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Locked => "locked",
            Self::CorruptedBackup(_) => "corrupted_backup",
            Self::UnknownMethod(_) => "unknown_method",
            Self::DuplicateMethod(_) => "duplicate_method",
            Self::InvalidState(_) => "invalid_state",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Rejected(_) => "rejected",
            Self::Storage(_) => "storage",
            Self::Crypto(_) => "crypto",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller can recover by retrying with different input
    /// (another password, unlocking first, a different method name).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Locked
                | Self::BadRequest(_)
                | Self::NotFound(_)
                | Self::Rejected(_)
                | Self::UnknownMethod(_)
        )
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

/// Result type alias for wallet operations
pub type Result<T> = std::result::Result<T, WalletError>;
