//! Document (single-JSON-file) BID persistence, one of the two on-disk
//! forms (spec 4.6). Grounded on `backup_dao.py`'s `save`/`load` pair and
//! its `to_serialization_dict`/`from_serialization_dict` round trip.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::BackupInformationDatabase;
use crate::error::{BidError, BidResult};

/// Current document schema version. Bumped only when the on-disk shape of
/// `DocumentFormat` changes incompatibly.
pub const CURRENT_VERSION: u32 = 2;

/// Legacy pre-history version, whose `backup_info_dir` field could be
/// either a single string or a list of strings (spec 9, Open Questions
/// #3).
const LEGACY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DocumentFormat {
    version: u32,
    database: BackupInformationDatabase,
}

/// The pre-history shape: same database content, but `backup_info_dir`
/// could serialize as either a bare string or a list.
#[derive(Debug, Deserialize)]
struct LegacyDocumentFormat {
    version: u32,
    database: BackupInformationDatabase,
    #[serde(default)]
    backup_info_dir: Option<LegacyBackupInfoDir>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyBackupInfoDir {
    Single(String),
    Many(Vec<String>),
}

impl LegacyBackupInfoDir {
    fn normalize(self) -> Vec<std::path::PathBuf> {
        match self {
            LegacyBackupInfoDir::Single(s) => vec![std::path::PathBuf::from(s)],
            LegacyBackupInfoDir::Many(v) => v.into_iter().map(std::path::PathBuf::from).collect(),
        }
    }
}

/// Serialize `database` to the current document-format JSON bytes. Shared by
/// [`save`] and by the orchestrator's "upload the BID itself" seal step
/// (spec 4.5 step 9), which needs the raw bytes rather than a file on disk.
pub fn encode(database: &BackupInformationDatabase) -> BidResult<Vec<u8>> {
    let doc = DocumentFormat {
        version: CURRENT_VERSION,
        database: database.clone(),
    };
    Ok(serde_json::to_vec(&doc)?)
}

/// Parse document-format JSON bytes into a database, applying the legacy
/// migration if the stored version predates [`CURRENT_VERSION`]. Shared by
/// [`load`] and by `recovery::recover`, which decodes the uploaded BID
/// object's body through the same path.
pub fn decode(raw: &[u8]) -> BidResult<BackupInformationDatabase> {
    let probe: serde_json::Value = serde_json::from_slice(raw)?;
    let version = probe
        .get("version")
        .and_then(|v| v.as_u64())
        .unwrap_or(LEGACY_VERSION as u64) as u32;

    if version == LEGACY_VERSION {
        let legacy: LegacyDocumentFormat = serde_json::from_slice(raw)?;
        let normalized_dirs: Vec<std::path::PathBuf> = legacy
            .backup_info_dir
            .map(LegacyBackupInfoDir::normalize)
            .unwrap_or_default();
        let mut database = legacy.database;
        database.legacy_backup_info_dir = normalized_dirs;
        database.rebuild_indices()?;
        return Ok(database);
    }
    if version > CURRENT_VERSION {
        return Err(BidError::SchemaTooNew {
            found: version as i64,
            supported: CURRENT_VERSION as i64,
        });
    }

    let doc: DocumentFormat = serde_json::from_slice(raw)?;
    let mut database = doc.database;
    database.rebuild_indices()?;
    Ok(database)
}

/// Load a BID document from `path`, applying the legacy migration if the
/// stored version predates [`CURRENT_VERSION`].
pub fn load(path: &Path) -> BidResult<BackupInformationDatabase> {
    let raw = std::fs::read(path)?;
    decode(&raw)
}

/// Save `database` to `path`, first rotating any existing file to a
/// numbered backup (`path.1`, `path.2`, ...) so the previous document
/// always survives a crash mid-write (spec 4.6 "Saving").
pub fn save(database: &BackupInformationDatabase, path: &Path) -> BidResult<()> {
    if path.exists() {
        rotate_numbered_backup(path)?;
    }

    let json = encode(database)?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Detect whether `path`'s contents look like a document-form BID (as
/// opposed to the relational SQLite magic bytes).
pub fn is_document_format(bytes: &[u8]) -> bool {
    let trimmed = bytes.iter().find(|b| !b.is_ascii_whitespace());
    matches!(trimmed, Some(b'{'))
}

fn rotate_numbered_backup(path: &Path) -> BidResult<()> {
    let mut n = 1u32;
    loop {
        let candidate = numbered_path(path, n);
        if !candidate.exists() {
            std::fs::rename(path, &candidate)?;
            return Ok(());
        }
        n += 1;
    }
}

fn numbered_path(path: &Path, n: u32) -> std::path::PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("backup").to_string();
    name.push_str(&format!(".{}", n));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::{BackupType, SpecificBackupInformation};

    #[test]
    fn save_then_load_round_trips_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.json");
        let db = BackupInformationDatabase::new(Some("job".to_string()));
        save(&db, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.backup_base_name, Some("job".to_string()));
    }

    #[test]
    fn save_rotates_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.json");
        let db = BackupInformationDatabase::new(Some("job".to_string()));
        save(&db, &path).unwrap();
        save(&db, &path).unwrap();

        assert!(path.exists());
        assert!(dir.path().join("bid.json.1").exists());
    }

    #[test]
    fn save_then_load_preserves_appended_sbi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.json");
        let mut db = BackupInformationDatabase::new(None);
        let start = chrono::Utc::now();
        db.append(SpecificBackupInformation::new(
            "job".to_string(),
            start,
            BackupType::Full,
            [1u8; 32],
        ))
        .unwrap();
        save(&db, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.specific_backups.len(), 1);
        assert_eq!(loaded.specific_backups[0].backup_base_name, "job");
    }

    #[test]
    fn is_document_format_detects_json() {
        assert!(is_document_format(b"  {\"version\":2}"));
        assert!(!is_document_format(b"SQLite format 3\0"));
    }

    #[test]
    fn legacy_backup_info_dir_single_string_normalizes_to_list() {
        let db = BackupInformationDatabase::new(Some("job".to_string()));
        let doc = serde_json::json!({
            "version": LEGACY_VERSION,
            "database": serde_json::to_value(&db).unwrap(),
            "backup_info_dir": "/var/backup-info",
        });
        let raw = serde_json::to_vec(&doc).unwrap();

        let loaded = decode(&raw).unwrap();
        assert_eq!(
            loaded.legacy_backup_info_dir,
            vec![std::path::PathBuf::from("/var/backup-info")]
        );
    }

    #[test]
    fn legacy_backup_info_dir_list_normalizes_unchanged() {
        let db = BackupInformationDatabase::new(Some("job".to_string()));
        let doc = serde_json::json!({
            "version": LEGACY_VERSION,
            "database": serde_json::to_value(&db).unwrap(),
            "backup_info_dir": ["/a", "/b"],
        });
        let raw = serde_json::to_vec(&doc).unwrap();

        let loaded = decode(&raw).unwrap();
        assert_eq!(
            loaded.legacy_backup_info_dir,
            vec![std::path::PathBuf::from("/a"), std::path::PathBuf::from("/b")]
        );
    }

    #[test]
    fn current_version_document_has_empty_legacy_backup_info_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.json");
        let db = BackupInformationDatabase::new(Some("job".to_string()));
        save(&db, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert!(loaded.legacy_backup_info_dir.is_empty());
    }
}
