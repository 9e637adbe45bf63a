use thiserror::Error;

/// Stable identifiers for operator-facing errors. These strings are part of
/// the external contract; UIs key help text off them.
pub mod ids {
    pub const EMPTY_REMOTE_LOCATION: &str = "EmptyRemoteLocation";
    pub const MISSING_PASSPHRASE: &str = "MissingPassphrase";
    pub const RECREATE_TARGET_EXISTS: &str = "RecreateTargetDatabaseExists";
    pub const ENCRYPTED_DATABASE: &str = "EncryptedDatabase";
    pub const DOWNGRADE_BLOCKED: &str = "DowngradeBlocked";
    pub const FILE_MISSING: &str = "FileMissing";
    pub const INVALID_RETENTION_POLICY: &str = "InvalidRetentionPolicy";
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Recoverable by reconfiguration; carries a stable identifier string.
    #[error("{id}: {message}")]
    User { id: &'static str, message: String },

    /// Network or authentication failure against the remote target,
    /// surfaced after the backend layer has exhausted its retries.
    #[error("Remote operation failed on {name}: {message}")]
    Remote { name: String, message: String },

    /// Mismatched row counts or dangling references during a cascade.
    /// Always fatal; the caller must run repair or recreate.
    #[error("Inconsistent database: {0}")]
    InconsistentDatabase(String),

    /// Hash mismatch, malformed blocklist, or bad container data.
    /// Ingest loops log this as a warning and skip the volume.
    #[error("Corrupt volume {name}: {reason}")]
    CorruptVolume { name: String, reason: String },

    /// Cooperative cancellation was honoured.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Volume format error: {0}")]
    VolumeFormat(String),
}

impl EngineError {
    /// Shorthand for a [`EngineError::User`] with a stable identifier.
    pub fn user(id: &'static str, message: impl Into<String>) -> Self {
        EngineError::User {
            id,
            message: message.into(),
        }
    }

    /// Wrap a remote failure with the offending filename.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::CorruptVolume {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<sea_orm::TryGetError> for EngineError {
    fn from(e: sea_orm::TryGetError) -> Self {
        EngineError::Database(e.into())
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(e: zip::result::ZipError) -> Self {
        EngineError::VolumeFormat(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::VolumeFormat(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
