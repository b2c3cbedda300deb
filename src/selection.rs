//! Selector parsing and resolution (spec 4.8), consumed by
//! `restore`/`verify`/`list`. Grounded on
//! `original_source/src/atbu/tools/backup/backup_selections.py`.

use glob::Pattern;

use crate::bid::{BackupFileInformation, BackupInformationDatabase, SpecificBackupInformation};
use crate::error::{BackupError, Result};

/// One parsed `storage:`/`storage-def:` selector, or a bare absolute
/// directory path resolving to a filesystem storage definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSelector {
    pub name: String,
}

impl StorageSelector {
    /// Parse a single `storage:<name>` / `storage-def:<name>` token, or a
    /// bare absolute path (spec 4.8).
    pub fn parse(token: &str) -> Result<Self> {
        if let Some(rest) = token.strip_prefix("storage-def:") {
            return Ok(Self { name: rest.to_string() });
        }
        if let Some(rest) = token.strip_prefix("storage:") {
            return Ok(Self { name: rest.to_string() });
        }
        if token.starts_with('/') || token.starts_with('\\') {
            return Ok(Self { name: token.to_string() });
        }
        Err(BackupError::Selection(format!(
            "not a storage selector: '{}'",
            token
        )))
    }
}

/// A `backup:last` or `backup:<glob>` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelector {
    Last,
    Glob(String),
}

impl BackupSelector {
    pub fn parse(token: &str) -> Result<Self> {
        let rest = token
            .strip_prefix("backup:")
            .ok_or_else(|| BackupError::Selection(format!("not a backup selector: '{}'", token)))?;
        if rest == "last" {
            Ok(BackupSelector::Last)
        } else {
            Ok(BackupSelector::Glob(rest.to_string()))
        }
    }

    fn matches(&self, sbi: &SpecificBackupInformation, is_newest: bool) -> bool {
        match self {
            BackupSelector::Last => is_newest,
            BackupSelector::Glob(pattern) => Pattern::new(pattern)
                .map(|p| p.matches(&sbi.specific_backup_name))
                .unwrap_or(false),
        }
    }
}

/// A `files:<glob>` selector, matched against the normalised full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    pub pattern: String,
}

impl FileSelector {
    pub fn parse(token: &str) -> Result<Self> {
        let rest = token
            .strip_prefix("files:")
            .ok_or_else(|| BackupError::Selection(format!("not a files selector: '{}'", token)))?;
        Ok(Self {
            pattern: rest.to_string(),
        })
    }

    fn matches(&self, fi: &BackupFileInformation) -> bool {
        Pattern::new(&self.pattern)
            .map(|p| p.matches(&fi.path))
            .unwrap_or(false)
    }
}

/// The parsed components of a selection expression (spec 4.8). At least
/// one `storage` selector is required; `backups` and `files` default to
/// "everything" when absent.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub storages: Vec<StorageSelector>,
    pub backups: Vec<BackupSelector>,
    pub files: Vec<FileSelector>,
}

impl Selection {
    /// Parse a whitespace-separated sequence of selector tokens.
    pub fn parse(tokens: &[&str]) -> Result<Self> {
        let mut selection = Selection::default();
        for token in tokens {
            if token.starts_with("storage:") || token.starts_with("storage-def:") || token.starts_with('/') {
                selection.storages.push(StorageSelector::parse(token)?);
            } else if token.starts_with("backup:") {
                selection.backups.push(BackupSelector::parse(token)?);
            } else if token.starts_with("files:") {
                selection.files.push(FileSelector::parse(token)?);
            } else {
                return Err(BackupError::Selection(format!(
                    "unrecognized selector token: '{}'",
                    token
                )));
            }
        }
        if selection.storages.is_empty() {
            return Err(BackupError::Selection(
                "selection requires at least one storage: selector".to_string(),
            ));
        }
        Ok(selection)
    }

    fn backup_matches(&self, sbi: &SpecificBackupInformation, is_newest: bool) -> bool {
        if self.backups.is_empty() {
            return true;
        }
        self.backups.iter().any(|b| b.matches(sbi, is_newest))
    }

    fn file_matches(&self, fi: &BackupFileInformation) -> bool {
        if self.files.is_empty() {
            return true;
        }
        self.files.iter().any(|f| f.matches(fi))
    }
}

/// One resolved SBI and the deduplicated set of BFIs within it that
/// matched the file selectors, newest SBI first.
pub struct ResolvedBackup<'a> {
    pub sbi: &'a SpecificBackupInformation,
    pub files: Vec<&'a BackupFileInformation>,
}

/// Resolve `selection` against one storage definition's BID (spec 4.8
/// "Selection resolution").
pub fn resolve<'a>(
    selection: &Selection,
    db: &'a BackupInformationDatabase,
) -> Vec<ResolvedBackup<'a>> {
    let ordered = db.specific_backups_descending();
    let mut resolved = Vec::new();
    for (idx, sbi) in ordered.iter().enumerate() {
        let is_newest = idx == 0;
        if !selection.backup_matches(sbi, is_newest) {
            continue;
        }
        let files: Vec<&BackupFileInformation> = sbi
            .all_file_info
            .iter()
            .filter(|fi| selection.file_matches(fi))
            .collect();
        resolved.push(ResolvedBackup { sbi, files });
    }
    resolved
}

/// "Latest wins" fold over an ordered (newest-first) list of resolved
/// backups, collapsing duplicate paths across SBIs so each logical file
/// appears once, taken from its newest matching SBI (spec 4.8).
pub fn fold_latest_wins<'a>(resolved: &'a [ResolvedBackup<'a>]) -> Vec<&'a BackupFileInformation> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for backup in resolved {
        for fi in &backup.files {
            let key = fi.normalized_path_key();
            if seen.insert(key) {
                out.push(*fi);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::{BackupType, DeduplicationOption};
    use chrono::TimeZone;

    fn bfi(path: &str) -> BackupFileInformation {
        let mut fi = BackupFileInformation::new(path.to_string(), path.to_string(), "/src".to_string());
        fi.is_successful = true;
        fi.deduplication_option = DeduplicationOption::None;
        fi
    }

    fn sbi(name: &str, hour: u32, files: Vec<BackupFileInformation>) -> SpecificBackupInformation {
        let start = chrono::Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap();
        let mut s = SpecificBackupInformation::new(name.to_string(), start, BackupType::Full, [0u8; 32]);
        s.all_file_info = files;
        s
    }

    #[test]
    fn parses_storage_backup_files_tokens() {
        let selection =
            Selection::parse(&["storage:job", "backup:last", "files:*.txt"]).unwrap();
        assert_eq!(selection.storages[0].name, "job");
        assert_eq!(selection.backups[0], BackupSelector::Last);
        assert_eq!(selection.files[0].pattern, "*.txt");
    }

    #[test]
    fn bare_absolute_path_resolves_as_storage_selector() {
        let selection = Selection::parse(&["/mnt/backups"]).unwrap();
        assert_eq!(selection.storages[0].name, "/mnt/backups");
    }

    #[test]
    fn requires_a_storage_selector() {
        assert!(Selection::parse(&["backup:last"]).is_err());
    }

    #[test]
    fn backup_last_resolves_only_newest_sbi() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt")])).unwrap();
        db.append(sbi("job", 2, vec![bfi("b.txt")])).unwrap();

        let selection = Selection::parse(&["storage:job", "backup:last"]).unwrap();
        let resolved = resolve(&selection, &db);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].sbi.specific_backup_name, db.specific_backups[1].specific_backup_name);
    }

    #[test]
    fn latest_wins_fold_collapses_duplicate_paths() {
        let mut db = BackupInformationDatabase::new(None);
        db.append(sbi("job", 1, vec![bfi("a.txt")])).unwrap();
        db.append(sbi("job", 2, vec![bfi("a.txt")])).unwrap();

        let selection = Selection::parse(&["storage:job"]).unwrap();
        let resolved = resolve(&selection, &db);
        let folded = fold_latest_wins(&resolved);
        assert_eq!(folded.len(), 1);
    }
}
