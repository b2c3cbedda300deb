//! # atbu-backup-core
//!
//! Content-addressed, deduplicating, encrypted backup engine core.
//!
//! The engine hashes each source file, consults a per-destination
//! *backup information database* (BID) to decide whether the content is
//! new or a duplicate of something already stored, optionally compresses
//! and encrypts the bytes, and uploads the result to a pluggable object
//! store. Restore and verify run the inverse pipeline: download, decrypt,
//! decompress, and check the recovered bytes against the digests and
//! metadata recorded at backup time.
//!
//! ## Modules
//!
//! - [`bid`]: the backup information data model (BFI/SBI) and its
//!   relational and JSON-document persistence formats.
//! - [`hasher`]: streaming file digests with restart-on-change detection.
//! - [`crypto`]: key derivation and AES-256-CBC encryption of stored
//!   objects.
//! - [`codec`]: the on-the-wire object header and preamble framing.
//! - [`storage`]: the pluggable object store abstraction and its
//!   filesystem, S3, and Azure backends.
//! - [`pipeline`]: the bounded, worker-pooled stage pipeline shared by
//!   backup and retrieval.
//! - [`orchestrator`]: the backup session driver (hash, decide,
//!   compress, upload).
//! - [`retrieval`]: the restore/verify session driver (download, decrypt,
//!   decompress, verify).
//! - [`recovery`]: rebuilding a lost local BID from the sealed object the
//!   orchestrator uploads at the end of every backup session.
//! - [`selection`]: the `storage:`/`backup:`/`files:` selector language
//!   used to scope a restore, verify, or list operation.
//! - [`error`]: the per-concern error types and `Result` aliases used
//!   throughout the crate.
//!
//! ## Example
//!
//! ```rust
//! use atbu_backup_core::bid::{BackupInformationDatabase, BackupType, SpecificBackupInformation};
//!
//! let mut db = BackupInformationDatabase::new(None);
//! let sbi = SpecificBackupInformation::new(
//!     "nightly".to_string(),
//!     chrono::Utc::now(),
//!     BackupType::Full,
//!     [0u8; 32],
//! );
//! db.append(sbi).expect("first backup for a fresh database always succeeds");
//! assert_eq!(db.specific_backups.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(dead_code)]

pub mod bid;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod hasher;
pub mod orchestrator;
pub mod pipeline;
pub mod recovery;
pub mod retrieval;
pub mod selection;
pub mod storage;

pub use bid::{
    BackupFileInformation, BackupInformationDatabase, BackupType, BfiRef, DeduplicationOption,
    SpecificBackupInformation,
};
pub use codec::{ObjectHeader, Preamble, PreambleCompression};
pub use crypto::{KeyProvider, MasterKey, PasswordKeyProvider, StaticKeyProvider};
pub use error::{BackupError, Result};
pub use hasher::{FileHasher, StreamingHasher};
pub use orchestrator::{BackupConfig, BackupOrchestrator, BackupSessionReport, DestinationLock};
pub use pipeline::{Pipeline, Stage, StageKind, StageSpec, WorkItem};
pub use recovery::{recover, BID_OBJECT_PREFIX};
pub use retrieval::{DecryptSink, FileSink, RetrievalReport, Sink, VerifyOnlySink};
pub use selection::{BackupSelector, FileSelector, Selection, StorageSelector};
pub use storage::{create_object_store, Container, Object, ObjectStore, StorageConfig};

/// Version of the backup engine core, taken from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types and traits, for glob import by callers.
pub mod prelude {
    //! Commonly used types and traits.

    pub use crate::bid::{BackupFileInformation, BackupInformationDatabase, BackupType};
    pub use crate::error::{BackupError, Result};
    pub use crate::orchestrator::{BackupConfig, BackupOrchestrator};
    pub use crate::recovery::recover;
    pub use crate::retrieval::{retrieve, RetrievalReport};
    pub use crate::selection::Selection;
    pub use crate::storage::{ObjectStore, StorageConfig};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_package_version() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn default_backup_config_favors_full_non_dry_run_backups() {
        let config = BackupConfig::default();
        assert_eq!(config.backup_type, BackupType::Full);
        assert!(!config.dry_run);
        assert!(config.compression_enabled);
    }

    #[test]
    fn fresh_bid_accepts_its_first_specific_backup() {
        let mut db = BackupInformationDatabase::new(None);
        let sbi = SpecificBackupInformation::new(
            "job".to_string(),
            chrono::Utc::now(),
            BackupType::Full,
            [1u8; 32],
        );
        assert!(db.append(sbi).is_ok());
        assert_eq!(db.specific_backups.len(), 1);
    }
}
