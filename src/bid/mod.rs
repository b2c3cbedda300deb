//! Backup information database: the BFI/SBI/BID data model (spec 3) plus
//! the query contracts the orchestrator's decision stage consults (spec
//! 4.6). New relative to the teacher crate — the nearest relative is
//! `IncrementalBackupManager`'s manifest
//! (`examples/harborgrid-justin-esxi/.../incremental.rs`), which donates
//! the "one JSON manifest per session" idea, generalized here into the
//! full BFI/SBI/BID model. Query semantics are grounded on
//! `original_source/src/atbu/tools/backup/backup_dao.py`.

pub mod document;
pub mod relational;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BidError, BidResult};

/// How a file's backup type governs the prefilter/decision pipeline (spec
/// 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    Full,
    Incremental,
    IncrementalPlus,
    IncrementalHybrid,
}

/// Deduplication strategy consulted by the decision stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeduplicationOption {
    None,
    Digest,
    DigestExt,
}

/// A stable reference to another BFI within the same `BackupInformationDatabase`,
/// used for `backing_fi` resolution without a self-referential owned graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfiRef {
    pub sbi_index: usize,
    pub bfi_index: usize,
}

/// One file's state at one point in time (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileInformation {
    pub path: String,
    pub path_without_root: String,
    pub discovery_path: String,

    pub size_in_bytes: u64,
    pub modified_time: f64,
    pub accessed_time: f64,

    /// algorithm name -> hex digest. The primary algorithm is always
    /// `crate::hasher::PRIMARY_ALGORITHM`.
    pub digests: HashMap<String, String>,

    pub is_backup_encrypted: bool,
    pub encryption_iv: Option<[u8; 16]>,
    pub ciphertext_hash_during_backup: Option<String>,

    pub storage_object_name: Option<String>,

    pub is_unchanged_since_last: bool,
    pub backing_fi: Option<BfiRef>,

    pub deduplication_option: DeduplicationOption,
    pub is_backing_fi_digest: bool,

    pub is_successful: bool,
    pub exception: Option<String>,
}

impl BackupFileInformation {
    pub fn new(path: String, path_without_root: String, discovery_path: String) -> Self {
        Self {
            path,
            path_without_root,
            discovery_path,
            size_in_bytes: 0,
            modified_time: 0.0,
            accessed_time: 0.0,
            digests: HashMap::new(),
            is_backup_encrypted: false,
            encryption_iv: None,
            ciphertext_hash_during_backup: None,
            storage_object_name: None,
            is_unchanged_since_last: false,
            backing_fi: None,
            deduplication_option: DeduplicationOption::None,
            is_backing_fi_digest: false,
            is_successful: false,
            exception: None,
        }
    }

    /// The primary (SHA-256) digest, if hashing has completed.
    pub fn primary_digest(&self) -> Option<&str> {
        self.digests.get(crate::hasher::PRIMARY_ALGORITHM).map(String::as_str)
    }

    /// The filename extension (including leading `.`), matching the
    /// original's `ext` property used for `digest-ext` dedup matching.
    pub fn extension(&self) -> &str {
        match self.path_without_root.rfind('.') {
            Some(idx) if idx > 0 => &self.path_without_root[idx..],
            _ => "",
        }
    }

    /// Case-normalised key used for path-based index lookups, matching
    /// the original's `os.path.normcase`.
    pub fn normalized_path_key(&self) -> String {
        normalize_path_key(&self.path_without_root)
    }

    /// An encrypted object's required invariant (spec 3): an encrypted BFI
    /// carries exactly a 16-byte IV.
    pub fn validate_invariants(&self) -> BidResult<()> {
        if self.is_backup_encrypted && self.encryption_iv.is_none() {
            return Err(BidError::IntegrityGuard(format!(
                "encrypted BFI for '{}' is missing its IV",
                self.path_without_root
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn normalize_path_key(path: &str) -> String {
    path.to_string()
}

#[cfg(windows)]
fn normalize_path_key(path: &str) -> String {
    path.to_lowercase().replace('/', "\\")
}

/// One backup session (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificBackupInformation {
    pub backup_base_name: String,
    pub specific_backup_name: String,
    pub backup_start_time_utc: chrono::DateTime<chrono::Utc>,
    pub backup_type: BackupType,
    pub object_name_hash_salt: [u8; 32],
    pub all_file_info: Vec<BackupFileInformation>,
}

impl SpecificBackupInformation {
    /// Derive `<base>-YYYYMMDD-HHMMSS` in UTC (spec 3).
    pub fn derive_name(backup_base_name: &str, start_time: chrono::DateTime<chrono::Utc>) -> String {
        format!("{}-{}", backup_base_name, start_time.format("%Y%m%d-%H%M%S"))
    }

    pub fn new(
        backup_base_name: String,
        backup_start_time_utc: chrono::DateTime<chrono::Utc>,
        backup_type: BackupType,
        object_name_hash_salt: [u8; 32],
    ) -> Self {
        let specific_backup_name = Self::derive_name(&backup_base_name, backup_start_time_utc);
        Self {
            backup_base_name,
            specific_backup_name,
            backup_start_time_utc,
            backup_type,
            object_name_hash_salt,
            all_file_info: Vec::new(),
        }
    }
}

/// All SBIs for one storage definition, plus the derived indices the
/// decision stage queries (spec 3, spec 4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupInformationDatabase {
    pub backup_base_name: Option<String>,
    pub specific_backups: Vec<SpecificBackupInformation>,

    /// `backup_info_dir` carried over from a legacy (pre-history) JSON
    /// document, normalized to a list regardless of whether the source
    /// document serialized it as a bare string or a list (spec 9, Open
    /// Questions #3). Empty for databases that never went through that
    /// migration.
    #[serde(default)]
    pub legacy_backup_info_dir: Vec<PathBuf>,

    #[serde(skip)]
    path_to_info_all: HashMap<String, BfiRef>,
    #[serde(skip)]
    path_to_info_last: HashMap<String, BfiRef>,
    #[serde(skip)]
    digest_to_list_info: HashMap<String, Vec<BfiRef>>,
}

impl BackupInformationDatabase {
    pub fn new(backup_base_name: Option<String>) -> Self {
        Self {
            backup_base_name,
            specific_backups: Vec::new(),
            legacy_backup_info_dir: Vec::new(),
            path_to_info_all: HashMap::new(),
            path_to_info_last: HashMap::new(),
            digest_to_list_info: HashMap::new(),
        }
    }

    /// Append a new SBI (spec 3's SBI lifecycle: "created at session
    /// start... sealed on session end").
    pub fn append(&mut self, sbi: SpecificBackupInformation) -> BidResult<()> {
        if let Some(existing) = &self.backup_base_name {
            if existing != &sbi.backup_base_name {
                return Err(BidError::IntegrityGuard(format!(
                    "backup base name mismatch: db={} sbi={}",
                    existing, sbi.backup_base_name
                )));
            }
        } else {
            self.backup_base_name = Some(sbi.backup_base_name.clone());
        }
        if self
            .specific_backups
            .iter()
            .any(|s| s.specific_backup_name == sbi.specific_backup_name)
        {
            return Err(BidError::DuplicateSpecificBackupName(
                sbi.specific_backup_name,
            ));
        }
        self.specific_backups.push(sbi);
        self.rebuild_indices()?;
        Ok(())
    }

    /// SBIs ordered newest-first by `backup_start_time_utc`.
    pub fn specific_backups_descending(&self) -> Vec<&SpecificBackupInformation> {
        let mut v: Vec<&SpecificBackupInformation> = self.specific_backups.iter().collect();
        v.sort_by(|a, b| b.backup_start_time_utc.cmp(&a.backup_start_time_utc));
        v
    }

    fn resolve(&self, r: BfiRef) -> &BackupFileInformation {
        &self.specific_backups[r.sbi_index].all_file_info[r.bfi_index]
    }

    /// Rebuild `path_to_info_all`/`path_to_info_last`/`digest_to_list_info`
    /// from `specific_backups`, newest session first, first-write-wins per
    /// path. Mirrors `backup_dao.py`'s `_rebuild_hashes`.
    pub fn rebuild_indices(&mut self) -> BidResult<()> {
        self.path_to_info_all.clear();
        self.path_to_info_last.clear();
        self.digest_to_list_info.clear();

        let order: Vec<usize> = {
            let mut idx: Vec<usize> = (0..self.specific_backups.len()).collect();
            idx.sort_by(|&a, &b| {
                self.specific_backups[b]
                    .backup_start_time_utc
                    .cmp(&self.specific_backups[a].backup_start_time_utc)
            });
            idx
        };

        let mut needs_backing: HashMap<String, Vec<BfiRef>> = HashMap::new();
        let mut needs_backing_from_dedup: Vec<BfiRef> = Vec::new();

        for (pass, &sbi_index) in order.iter().enumerate() {
            let is_last_backup = pass == 0;
            let bfi_count = self.specific_backups[sbi_index].all_file_info.len();
            for bfi_index in 0..bfi_count {
                let bfi_ref = BfiRef { sbi_index, bfi_index };
                let bfi = &self.specific_backups[sbi_index].all_file_info[bfi_index];
                if !bfi.is_successful && !bfi.is_unchanged_since_last {
                    continue;
                }
                let key = bfi.normalized_path_key();

                if bfi.is_unchanged_since_last && bfi.backing_fi.is_none() {
                    if bfi.deduplication_option == DeduplicationOption::None {
                        needs_backing.entry(key.clone()).or_default().push(bfi_ref);
                    } else {
                        needs_backing_from_dedup.push(bfi_ref);
                    }
                }

                if !bfi.is_unchanged_since_last {
                    if let Some(waiting) = needs_backing.remove(&key) {
                        for waiting_ref in waiting {
                            let sbi = &mut self.specific_backups[waiting_ref.sbi_index];
                            sbi.all_file_info[waiting_ref.bfi_index].backing_fi = Some(bfi_ref);
                        }
                    }
                    if let Some(digest) = bfi.primary_digest() {
                        self.digest_to_list_info
                            .entry(digest.to_string())
                            .or_default()
                            .push(bfi_ref);
                    }
                }

                self.path_to_info_all.entry(key.clone()).or_insert(bfi_ref);
                if is_last_backup {
                    self.path_to_info_last.entry(key).or_insert(bfi_ref);
                }
            }
        }

        needs_backing_from_dedup.retain(|&wanting_ref| {
            let wanting = self.resolve(wanting_ref).clone();
            match self.duplicate(wanting.deduplication_option, &wanting) {
                Some(dup_ref) => {
                    let sbi = &mut self.specific_backups[wanting_ref.sbi_index];
                    sbi.all_file_info[wanting_ref.bfi_index].backing_fi = Some(dup_ref);
                    false
                }
                None => true,
            }
        });

        if !needs_backing.is_empty() {
            let paths: Vec<&String> = needs_backing.keys().collect();
            return Err(BidError::IntegrityGuard(format!(
                "unresolved backing_fi references for paths: {:?}",
                paths
            )));
        }
        Ok(())
    }

    /// `date_size_changed` (spec 4.6): whether `cur`'s `(size, mtime)`
    /// differ from the most recent BFI at the same path.
    pub fn date_size_changed(
        &self,
        cur: &BackupFileInformation,
    ) -> (bool, Option<&BackupFileInformation>) {
        let existing = self.most_recent_for_path(&cur.path_without_root);
        let changed = match existing {
            Some(e) => !(cur.size_in_bytes == e.size_in_bytes && cur.modified_time == e.modified_time),
            None => true,
        };
        (changed, existing)
    }

    /// `digest_changed` (spec 4.6).
    pub fn digest_changed(
        &self,
        cur: &BackupFileInformation,
    ) -> (bool, Option<&BackupFileInformation>) {
        let existing = self.most_recent_for_path(&cur.path_without_root);
        let changed = match existing {
            Some(e) => cur.primary_digest() != e.primary_digest(),
            None => true,
        };
        (changed, existing)
    }

    /// `duplicate(dedup_mode, fi)` (spec 4.6): scans entries sharing the
    /// primary digest for a matching `(size, mtime[, ext])`.
    pub fn duplicate(
        &self,
        dedup_mode: DeduplicationOption,
        cur: &BackupFileInformation,
    ) -> Option<BfiRef> {
        let digest = cur.primary_digest()?;
        let candidates = self.digest_to_list_info.get(digest)?;
        let check_ext = dedup_mode == DeduplicationOption::DigestExt;
        candidates
            .iter()
            .find(|&&cand_ref| {
                let cand = self.resolve(cand_ref);
                cand.size_in_bytes == cur.size_in_bytes
                    && cand.modified_time == cur.modified_time
                    && (!check_ext || (!cur.extension().is_empty() && cur.extension() == cand.extension()))
            })
            .copied()
    }

    /// `sneaky_corruption(fi)` (spec 4.6): true iff the prior same-path BFI
    /// has equal size/mtime but a different primary digest.
    pub fn sneaky_corruption(
        &self,
        cur: &BackupFileInformation,
    ) -> (bool, Option<&BackupFileInformation>) {
        let (date_size_changed, existing) = self.date_size_changed(cur);
        if date_size_changed || existing.is_none() {
            return (false, existing);
        }
        let existing = existing.unwrap();
        (cur.primary_digest() != existing.primary_digest(), Some(existing))
    }

    /// `most_recent_for_path(path)` (spec 4.6).
    pub fn most_recent_for_path(&self, path_without_root: &str) -> Option<&BackupFileInformation> {
        let key = normalize_path_key(path_without_root);
        self.path_to_info_all.get(&key).map(|&r| self.resolve(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn bfi(path: &str, size: u64, mtime: f64, digest: &str, is_successful: bool) -> BackupFileInformation {
        let mut fi = BackupFileInformation::new(path.to_string(), path.to_string(), "/src".to_string());
        fi.size_in_bytes = size;
        fi.modified_time = mtime;
        let mut digests = Map::new();
        digests.insert(crate::hasher::PRIMARY_ALGORITHM.to_string(), digest.to_string());
        fi.digests = digests;
        fi.is_successful = is_successful;
        fi
    }

    fn sbi(name: &str, hour: u32, files: Vec<BackupFileInformation>) -> SpecificBackupInformation {
        let start = chrono::Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap();
        let mut s = SpecificBackupInformation::new(name.to_string(), start, BackupType::Full, [0u8; 32]);
        s.all_file_info = files;
        s
    }

    use chrono::TimeZone;

    #[test]
    fn most_recent_for_path_prefers_newest_session() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt", 10, 100.0, "d1", true)]))
            .unwrap();
        db.append(sbi("job", 2, vec![bfi("a.txt", 20, 200.0, "d2", true)]))
            .unwrap();

        let found = db.most_recent_for_path("a.txt").unwrap();
        assert_eq!(found.size_in_bytes, 20);
        assert_eq!(found.primary_digest(), Some("d2"));
    }

    #[test]
    fn sneaky_corruption_flags_same_stat_different_digest() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt", 10, 100.0, "d1", true)]))
            .unwrap();

        let cur = bfi("a.txt", 10, 100.0, "d2", true);
        let (suspected, prior) = db.sneaky_corruption(&cur);
        assert!(suspected);
        assert_eq!(prior.unwrap().primary_digest(), Some("d1"));
    }

    #[test]
    fn sneaky_corruption_not_flagged_when_stat_changed() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt", 10, 100.0, "d1", true)]))
            .unwrap();

        let cur = bfi("a.txt", 11, 150.0, "d2", true);
        let (suspected, _) = db.sneaky_corruption(&cur);
        assert!(!suspected);
    }

    #[test]
    fn duplicate_requires_matching_size_and_mtime() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt", 10, 100.0, "shared", true)]))
            .unwrap();

        let matching = bfi("b.txt", 10, 100.0, "shared", true);
        assert!(db.duplicate(DeduplicationOption::Digest, &matching).is_some());

        let mismatched = bfi("c.txt", 99, 100.0, "shared", true);
        assert!(db.duplicate(DeduplicationOption::Digest, &mismatched).is_none());
    }

    #[test]
    fn digest_changed_detects_path_history() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt", 10, 100.0, "d1", true)]))
            .unwrap();

        let unchanged = bfi("a.txt", 10, 100.0, "d1", true);
        assert!(!db.digest_changed(&unchanged).0);

        let changed = bfi("a.txt", 10, 100.0, "d2", true);
        assert!(db.digest_changed(&changed).0);
    }
}
