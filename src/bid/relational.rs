//! Relational (SQLite) BID persistence, the second on-disk form (spec
//! 4.6). Schema and migration-script-list shape grounded on
//! `original_source/src/atbu/tools/backup/persisted_info/database.py`;
//! query semantics grounded on `backup_dao.py`. `rusqlite` is a new
//! dependency relative to the teacher crate (`meridian-backup` has no
//! relational-storage dependency at all).

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection};

use super::{
    BackupFileInformation, BackupInformationDatabase, BackupType, BfiRef, DeduplicationOption,
    SpecificBackupInformation,
};
use crate::error::{BidError, BidResult};

/// Current schema version. Each entry in [`MIGRATIONS`] upgrades from
/// `index` to `index + 1`.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Linear list of versioned upgrade scripts (spec 4.6 "Schema
/// evolution"). Only one version exists today; future migrations are
/// appended here, never edited in place.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE backup_db (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        version INTEGER NOT NULL
    );

    CREATE TABLE backups (
        id INTEGER PRIMARY KEY,
        backup_db_id INTEGER NOT NULL REFERENCES backup_db(id),
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE specific_backups (
        id INTEGER PRIMARY KEY,
        backups_id INTEGER NOT NULL REFERENCES backups(id),
        name TEXT NOT NULL UNIQUE,
        backup_start_time_utc TEXT NOT NULL,
        object_name_hash_salt BLOB NOT NULL,
        backup_type TEXT NOT NULL
    );

    CREATE TABLE path_values (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL UNIQUE
    );

    CREATE TABLE digest_values (
        id INTEGER PRIMARY KEY,
        digest_type TEXT NOT NULL,
        digest TEXT NOT NULL,
        UNIQUE(digest_type, digest)
    );

    CREATE TABLE backup_file_info (
        id INTEGER PRIMARY KEY,
        specific_backup_id INTEGER NOT NULL REFERENCES specific_backups(id),
        path_value_id INTEGER NOT NULL REFERENCES path_values(id),
        last_modified REAL NOT NULL,
        last_accessed REAL NOT NULL,
        lastmodified_stamp TEXT,
        size_in_bytes INTEGER NOT NULL,
        discovery_path_value_id INTEGER NOT NULL REFERENCES path_values(id),
        is_successful INTEGER NOT NULL,
        exception TEXT,
        ciphertext_hash TEXT,
        encryption_iv BLOB,
        storage_object_name TEXT,
        is_unchanged_since_last INTEGER NOT NULL,
        is_backing_fi_digest INTEGER NOT NULL,
        deduplication_option TEXT NOT NULL
    );

    CREATE TABLE backup_file_digests (
        backup_file_info_id INTEGER NOT NULL REFERENCES backup_file_info(id),
        digest_value_id INTEGER NOT NULL REFERENCES digest_values(id),
        PRIMARY KEY (backup_file_info_id, digest_value_id)
    );

    CREATE INDEX idx_bfi_sb_path_disc
        ON backup_file_info(specific_backup_id, path_value_id, discovery_path_value_id);
    CREATE INDEX idx_digest_values_lookup ON digest_values(digest_type, digest);
    CREATE INDEX idx_bfi_unchanged ON backup_file_info(is_unchanged_since_last);
    CREATE INDEX idx_bfi_backing_digest ON backup_file_info(is_backing_fi_digest, path_value_id);

    CREATE TRIGGER guard_backup_file_info_paths
    BEFORE INSERT ON backup_file_info
    WHEN (SELECT COUNT(*) FROM path_values WHERE id = NEW.path_value_id) = 0
      OR (SELECT COUNT(*) FROM path_values WHERE id = NEW.discovery_path_value_id) = 0
    BEGIN
        SELECT RAISE(ABORT, 'backup_file_info requires matching path_values rows');
    END;
"#];

/// SQLite's file magic, used for format detection alongside
/// [`document::is_document_format`](super::document::is_document_format).
pub fn is_relational_format(bytes: &[u8]) -> bool {
    bytes.starts_with(b"SQLite format 3\0")
}

fn backup_type_to_str(t: BackupType) -> &'static str {
    match t {
        BackupType::Full => "full",
        BackupType::Incremental => "incremental",
        BackupType::IncrementalPlus => "incremental-plus",
        BackupType::IncrementalHybrid => "incremental-hybrid",
    }
}

fn backup_type_from_str(s: &str) -> BidResult<BackupType> {
    Ok(match s {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        "incremental-plus" => BackupType::IncrementalPlus,
        "incremental-hybrid" => BackupType::IncrementalHybrid,
        other => {
            return Err(BidError::IntegrityGuard(format!(
                "unknown backup_type '{}'",
                other
            )))
        }
    })
}

fn dedup_to_str(d: DeduplicationOption) -> &'static str {
    match d {
        DeduplicationOption::None => "none",
        DeduplicationOption::Digest => "digest",
        DeduplicationOption::DigestExt => "digest-ext",
    }
}

fn dedup_from_str(s: &str) -> DeduplicationOption {
    match s {
        "digest" => DeduplicationOption::Digest,
        "digest-ext" => DeduplicationOption::DigestExt,
        _ => DeduplicationOption::None,
    }
}

/// Open (creating if needed) the SQLite file at `path`, applying any
/// outstanding migrations and refusing to open a file whose stored
/// version is newer than this build supports.
pub fn open(path: &Path) -> BidResult<Connection> {
    let is_new = !path.exists();
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;

    if is_new {
        for script in MIGRATIONS {
            conn.execute_batch(script)?;
        }
        conn.execute(
            "INSERT INTO backup_db (name, version) VALUES (?1, ?2)",
            params!["backup_db", CURRENT_SCHEMA_VERSION],
        )?;
        return Ok(conn);
    }

    let stored_version: i64 = conn
        .query_row("SELECT version FROM backup_db LIMIT 1", [], |r| r.get(0))
        .map_err(|_| BidError::UnrecognizedFormat)?;

    if stored_version > CURRENT_SCHEMA_VERSION {
        return Err(BidError::SchemaTooNew {
            found: stored_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    for step in stored_version..CURRENT_SCHEMA_VERSION {
        conn.execute_batch(MIGRATIONS[step as usize])?;
    }
    if stored_version < CURRENT_SCHEMA_VERSION {
        conn.execute(
            "UPDATE backup_db SET version = ?1",
            params![CURRENT_SCHEMA_VERSION],
        )?;
    }
    Ok(conn)
}

fn intern_path(conn: &Connection, path: &str) -> BidResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO path_values (path) VALUES (?1)",
        params![path],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM path_values WHERE path = ?1",
        params![path],
        |r| r.get(0),
    )?)
}

fn intern_digest(conn: &Connection, digest_type: &str, digest: &str) -> BidResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO digest_values (digest_type, digest) VALUES (?1, ?2)",
        params![digest_type, digest],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM digest_values WHERE digest_type = ?1 AND digest = ?2",
        params![digest_type, digest],
        |r| r.get(0),
    )?)
}

/// Insert a single SBI (and its BFIs) into an already-open connection,
/// without touching any other SBI. Used for the "insert hint" fast path
/// (spec 4.6 "Saving").
pub fn insert_specific_backup(
    conn: &mut Connection,
    sbi: &SpecificBackupInformation,
) -> BidResult<()> {
    let tx = conn.transaction()?;

    let backup_id: i64 = {
        tx.execute(
            "INSERT OR IGNORE INTO backups (backup_db_id, name) \
             VALUES ((SELECT id FROM backup_db LIMIT 1), ?1)",
            params![sbi.backup_base_name],
        )?;
        tx.query_row(
            "SELECT id FROM backups WHERE name = ?1",
            params![sbi.backup_base_name],
            |r| r.get(0),
        )?
    };

    tx.execute(
        "INSERT INTO specific_backups \
         (backups_id, name, backup_start_time_utc, object_name_hash_salt, backup_type) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            backup_id,
            sbi.specific_backup_name,
            sbi.backup_start_time_utc.to_rfc3339(),
            sbi.object_name_hash_salt.to_vec(),
            backup_type_to_str(sbi.backup_type),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == 2067 => {
            BidError::DuplicateSpecificBackupName(sbi.specific_backup_name.clone())
        }
        other => BidError::Sqlite(other),
    })?;
    let sb_id: i64 = tx.last_insert_rowid();

    for fi in &sbi.all_file_info {
        let path_id = intern_path(&tx, &fi.path_without_root)?;
        let discovery_path_id = intern_path(&tx, &fi.discovery_path)?;

        tx.execute(
            "INSERT INTO backup_file_info \
             (specific_backup_id, path_value_id, last_modified, last_accessed, \
              lastmodified_stamp, size_in_bytes, discovery_path_value_id, is_successful, \
              exception, ciphertext_hash, encryption_iv, storage_object_name, \
              is_unchanged_since_last, is_backing_fi_digest, deduplication_option) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                sb_id,
                path_id,
                fi.modified_time,
                fi.accessed_time,
                None::<String>,
                fi.size_in_bytes as i64,
                discovery_path_id,
                fi.is_successful,
                fi.exception,
                fi.ciphertext_hash_during_backup,
                fi.encryption_iv.map(|iv| iv.to_vec()),
                fi.storage_object_name,
                fi.is_unchanged_since_last,
                fi.is_backing_fi_digest,
                dedup_to_str(fi.deduplication_option),
            ],
        )?;
        let bfi_id = tx.last_insert_rowid();

        for (algo, digest) in &fi.digests {
            let digest_id = intern_digest(&tx, algo, digest)?;
            tx.execute(
                "INSERT OR IGNORE INTO backup_file_digests (backup_file_info_id, digest_value_id) \
                 VALUES (?1, ?2)",
                params![bfi_id, digest_id],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// Rewrite `conn` entirely from `database` — used when no single-SBI
/// insert hint is available (spec 4.6 "Saving").
pub fn save_full(conn: &mut Connection, database: &BackupInformationDatabase) -> BidResult<()> {
    conn.execute("DELETE FROM backup_file_digests", [])?;
    conn.execute("DELETE FROM backup_file_info", [])?;
    conn.execute("DELETE FROM specific_backups", [])?;
    conn.execute("DELETE FROM backups", [])?;
    conn.execute("DELETE FROM digest_values", [])?;
    conn.execute("DELETE FROM path_values", [])?;

    for sbi in &database.specific_backups {
        insert_specific_backup(conn, sbi)?;
    }
    Ok(())
}

/// Reconstruct a [`BackupInformationDatabase`] from an open connection.
pub fn load(conn: &Connection) -> BidResult<BackupInformationDatabase> {
    let mut sb_stmt = conn.prepare(
        "SELECT sb.id, b.name, sb.name, sb.backup_start_time_utc, sb.object_name_hash_salt, sb.backup_type \
         FROM specific_backups sb JOIN backups b ON b.id = sb.backups_id \
         ORDER BY sb.backup_start_time_utc ASC",
    )?;

    let mut database = BackupInformationDatabase::new(None);

    let rows = sb_stmt.query_map([], |r| {
        let id: i64 = r.get(0)?;
        let backup_base_name: String = r.get(1)?;
        let specific_backup_name: String = r.get(2)?;
        let start_raw: String = r.get(3)?;
        let salt: Vec<u8> = r.get(4)?;
        let backup_type_raw: String = r.get(5)?;
        Ok((id, backup_base_name, specific_backup_name, start_raw, salt, backup_type_raw))
    })?;

    for row in rows {
        let (sb_id, backup_base_name, specific_backup_name, start_raw, salt, backup_type_raw) = row?;
        let backup_start_time_utc = chrono::DateTime::parse_from_rfc3339(&start_raw)
            .map_err(|e| BidError::IntegrityGuard(e.to_string()))?
            .with_timezone(&chrono::Utc);
        let backup_type = backup_type_from_str(&backup_type_raw)?;
        let mut salt_arr = [0u8; 32];
        if salt.len() == 32 {
            salt_arr.copy_from_slice(&salt);
        }

        let mut sbi = SpecificBackupInformation::new(
            backup_base_name,
            backup_start_time_utc,
            backup_type,
            salt_arr,
        );
        sbi.specific_backup_name = specific_backup_name;
        sbi.all_file_info = load_file_info(conn, sb_id)?;
        database.specific_backups.push(sbi);
    }

    database.rebuild_indices()?;
    Ok(database)
}

fn load_file_info(conn: &Connection, specific_backup_id: i64) -> BidResult<Vec<BackupFileInformation>> {
    let mut stmt = conn.prepare(
        "SELECT bfi.id, pv.path, dpv.path, bfi.last_modified, bfi.last_accessed, bfi.size_in_bytes, \
                bfi.is_successful, bfi.exception, bfi.ciphertext_hash, bfi.encryption_iv, \
                bfi.storage_object_name, bfi.is_unchanged_since_last, bfi.is_backing_fi_digest, \
                bfi.deduplication_option \
         FROM backup_file_info bfi \
         JOIN path_values pv ON pv.id = bfi.path_value_id \
         JOIN path_values dpv ON dpv.id = bfi.discovery_path_value_id \
         WHERE bfi.specific_backup_id = ?1",
    )?;

    let rows = stmt.query_map(params![specific_backup_id], |r| {
        let id: i64 = r.get(0)?;
        let path: String = r.get(1)?;
        let discovery_path: String = r.get(2)?;
        let last_modified: f64 = r.get(3)?;
        let last_accessed: f64 = r.get(4)?;
        let size_in_bytes: i64 = r.get(5)?;
        let is_successful: bool = r.get(6)?;
        let exception: Option<String> = r.get(7)?;
        let ciphertext_hash: Option<String> = r.get(8)?;
        let encryption_iv: Option<Vec<u8>> = r.get(9)?;
        let storage_object_name: Option<String> = r.get(10)?;
        let is_unchanged_since_last: bool = r.get(11)?;
        let is_backing_fi_digest: bool = r.get(12)?;
        let deduplication_option: String = r.get(13)?;
        Ok((
            id,
            path,
            discovery_path,
            last_modified,
            last_accessed,
            size_in_bytes,
            is_successful,
            exception,
            ciphertext_hash,
            encryption_iv,
            storage_object_name,
            is_unchanged_since_last,
            is_backing_fi_digest,
            deduplication_option,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (
            bfi_id,
            path,
            discovery_path,
            last_modified,
            last_accessed,
            size_in_bytes,
            is_successful,
            exception,
            ciphertext_hash,
            encryption_iv,
            storage_object_name,
            is_unchanged_since_last,
            is_backing_fi_digest,
            deduplication_option,
        ) = row?;

        let mut fi = BackupFileInformation::new(path.clone(), path, discovery_path);
        fi.modified_time = last_modified;
        fi.accessed_time = last_accessed;
        fi.size_in_bytes = size_in_bytes as u64;
        fi.is_successful = is_successful;
        fi.exception = exception;
        fi.ciphertext_hash_during_backup = ciphertext_hash;
        fi.is_backup_encrypted = encryption_iv.is_some();
        fi.encryption_iv = encryption_iv.and_then(|v| v.try_into().ok());
        fi.storage_object_name = storage_object_name;
        fi.is_unchanged_since_last = is_unchanged_since_last;
        fi.is_backing_fi_digest = is_backing_fi_digest;
        fi.deduplication_option = dedup_from_str(&deduplication_option);
        fi.digests = load_digests(conn, bfi_id)?;
        out.push(fi);
    }
    Ok(out)
}

fn load_digests(conn: &Connection, bfi_id: i64) -> BidResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT dv.digest_type, dv.digest FROM backup_file_digests bfd \
         JOIN digest_values dv ON dv.id = bfd.digest_value_id \
         WHERE bfd.backup_file_info_id = ?1",
    )?;
    let rows = stmt.query_map(params![bfi_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    let mut out = HashMap::new();
    for row in rows {
        let (algo, digest) = row?;
        out.insert(algo, digest);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::BackupType;

    fn sample_sbi() -> SpecificBackupInformation {
        let mut sbi = SpecificBackupInformation::new(
            "job".to_string(),
            chrono::Utc::now(),
            BackupType::Full,
            [5u8; 32],
        );
        let mut fi = BackupFileInformation::new(
            "/src/a.txt".to_string(),
            "a.txt".to_string(),
            "/src".to_string(),
        );
        fi.size_in_bytes = 123;
        fi.is_successful = true;
        fi.digests.insert("sha256".to_string(), "abc123".to_string());
        sbi.all_file_info.push(fi);
        sbi
    }

    #[test]
    fn open_creates_schema_on_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.sqlite");
        let conn = open(&path).unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM backup_db LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn insert_then_load_round_trips_file_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.sqlite");
        let mut conn = open(&path).unwrap();
        let sbi = sample_sbi();
        insert_specific_backup(&mut conn, &sbi).unwrap();

        let loaded = load(&conn).unwrap();
        assert_eq!(loaded.specific_backups.len(), 1);
        assert_eq!(loaded.specific_backups[0].all_file_info.len(), 1);
        assert_eq!(
            loaded.specific_backups[0].all_file_info[0].primary_digest(),
            Some("abc123")
        );
    }

    #[test]
    fn duplicate_specific_backup_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bid.sqlite");
        let mut conn = open(&path).unwrap();
        let sbi = sample_sbi();
        insert_specific_backup(&mut conn, &sbi).unwrap();
        let err = insert_specific_backup(&mut conn, &sbi).unwrap_err();
        assert!(matches!(err, BidError::DuplicateSpecificBackupName(_)));
    }

    #[test]
    fn is_relational_format_detects_sqlite_magic() {
        assert!(is_relational_format(b"SQLite format 3\0rest"));
        assert!(!is_relational_format(b"{\"version\":2}"));
    }
}
