//! Error types for the backup engine core.

use thiserror::Error;

/// Top-level error type for backup/restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("backup information database error: {0}")]
    Bid(#[from] BidError),

    #[error("hasher error: {0}")]
    Hasher(#[from] HasherError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("invalid backup state: {0}")]
    InvalidState(String),

    #[error("destination already in use: {0}")]
    BackupAlreadyInUse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("selection error: {0}")]
    Selection(String),

    #[error("password authentication failure after {0} attempts")]
    PasswordAuthenticationFailure(u32),

    /// A condition reached only through a post-retry branch whose trigger
    /// is unclear; preserved as "record and do not retry" rather than
    /// treated as a bug.
    #[error("unreachable condition encountered, not retrying: {0}")]
    Unreachable(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Storage backend specific errors.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3(String),

    #[error("Azure error: {0}")]
    Azure(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("object does not exist: {0}")]
    ObjectDoesNotExist(String),

    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StorageError {
    /// Whether this error kind is eligible for exponential-backoff retry.
    /// Each driver classifies its own errors; this is the conservative
    /// default shared by the in-tree drivers (spec 4.3 `retry_exceptions`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionFailed(_)
                | StorageError::Network(_)
                | StorageError::Timeout(_)
        )
    }
}

/// Encryption related errors.
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("invalid IV: expected 16 bytes, got {0}")]
    InvalidIv(usize),

    #[error("padding error during decryption")]
    PaddingError,
}

/// On-wire object codec errors (header/preamble framing).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("header too short: need at least 2 bytes, got {0}")]
    HeaderTooShort(usize),

    #[error("unsupported header version: {0}")]
    UnsupportedVersion(u8),

    #[error("IV flag set but insufficient bytes for IV")]
    TruncatedIv,

    #[error("declared IV length {0} is not 16")]
    InvalidIvLength(u8),

    #[error("preamble declares length {declared} but only {available} bytes available")]
    TruncatedPreamble { declared: usize, available: usize },

    #[error("preamble is not valid UTF-8")]
    InvalidPreambleEncoding,

    #[error("preamble missing required key: {0}")]
    MissingKey(&'static str),

    #[error(
        "preamble key '{0}' contains a comma, which is not permitted outside the final 'path' key"
    )]
    CommaInKey(String),

    #[error("preamble body exceeds maximum length of 65535 bytes")]
    PreambleTooLong,
}

/// Backup information database errors.
#[derive(Error, Debug)]
pub enum BidError {
    #[error("unrecognized BID format (bad magic bytes)")]
    UnrecognizedFormat,

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("refusing to downgrade BID schema from {found} to {target}")]
    RefuseDowngrade { found: i64, target: i64 },

    #[error("dangling backing_fi reference: sbi={sbi_index} bfi={bfi_index}")]
    DanglingBackingReference { sbi_index: usize, bfi_index: usize },

    #[error("duplicate specific backup name: {0}")]
    DuplicateSpecificBackupName(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity guard violation: {0}")]
    IntegrityGuard(String),
}

/// Hashing errors.
#[derive(Error, Debug)]
pub enum HasherError {
    #[error("file changed while hashing after {attempts} attempts: {path}")]
    FileChangedWhileHashing { path: String, attempts: u32 },

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline runtime errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage '{0}' panicked or was dropped without completing")]
    StageAborted(String),

    #[error("queue closed unexpectedly")]
    QueueClosed,

    #[error("pipe protocol violation: {0}")]
    PipeProtocolViolation(String),

    #[error("shutdown timed out waiting for stage '{0}' to drain")]
    ShutdownTimeout(String),
}

/// Result type alias for backup/restore operations.
pub type Result<T> = std::result::Result<T, BackupError>;
/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
/// Result type alias for encryption operations.
pub type EncryptionResult<T> = std::result::Result<T, EncryptionError>;
/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
/// Result type alias for BID operations.
pub type BidResult<T> = std::result::Result<T, BidError>;
/// Result type alias for hasher operations.
pub type HasherResult<T> = std::result::Result<T, HasherError>;
/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
