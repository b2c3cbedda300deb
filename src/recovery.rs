//! Recovery of a lost local backup information database from the object
//! store alone (spec 4.5 step 9 "seal", spec 6 `recover`, spec 8
//! "Recover-from-store"). The orchestrator's seal step uploads the whole
//! BID as one object after every session; this module is the inverse:
//! find the newest such object in a container, download it, and decode it
//! back into a [`BackupInformationDatabase`].

use crate::bid::BackupInformationDatabase;
use crate::codec::ObjectHeader;
use crate::crypto::MasterKey;
use crate::error::{BackupError, EncryptionError, Result};
use crate::storage::Container;

/// Object-name prefix the orchestrator's seal step uses, shared so
/// `recover` lists exactly the objects it wrote (spec 4.5 step 9).
pub const BID_OBJECT_PREFIX: &str = "zz-backup-info-";

/// Rebuild a [`BackupInformationDatabase`] from the newest sealed BID
/// object in `container` (spec 6 `recover`). The timestamp embedded in the
/// object name (`zz-backup-info-<YYYYMMDD-HHMMSS>.atbuinf[e]`) sorts
/// lexicographically, so the newest object is simply the last name in
/// sorted order.
pub async fn recover(
    container: &dyn Container,
    key: Option<&MasterKey>,
) -> Result<BackupInformationDatabase> {
    let mut candidates = container.list_objects(BID_OBJECT_PREFIX).await?;
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    let latest = candidates.last().ok_or_else(|| {
        BackupError::BackupNotFound(format!(
            "no object starting with '{}' found in container '{}'",
            BID_OBJECT_PREFIX,
            container.name()
        ))
    })?;

    let chunk_size = container.download_chunk_size();
    let mut chunks = container
        .download_object_as_stream(&latest.name, chunk_size)
        .await?;
    let mut all_bytes = Vec::new();
    while let Some(chunk) = chunks.recv().await {
        all_bytes.extend_from_slice(&chunk);
    }

    let (header, header_len) = ObjectHeader::parse(&all_bytes)?;
    let ciphertext = &all_bytes[header_len..];

    let plaintext = if header.has_iv() {
        let key = key.ok_or_else(|| {
            BackupError::Encryption(EncryptionError::InvalidKey(
                "sealed BID object is encrypted but no key was supplied".to_string(),
            ))
        })?;
        let iv = header
            .iv
            .ok_or_else(|| BackupError::Encryption(EncryptionError::InvalidIv(0)))?;
        crate::crypto::decrypt(key, &iv, ciphertext)?
    } else {
        ciphertext.to_vec()
    };

    Ok(crate::bid::document::decode(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::{BackupType, SpecificBackupInformation};
    use crate::crypto::{random_iv, KeyProvider, StaticKeyProvider};
    use crate::storage::filesystem::FilesystemStore;
    use crate::storage::{chunk_channel, ObjectStore};
    use bytes::Bytes;

    async fn upload_whole(container: &dyn Container, name: &str, bytes: Vec<u8>) {
        let (tx, rx) = chunk_channel();
        tx.send(Bytes::from(bytes)).await.unwrap();
        drop(tx);
        container.upload_stream_to_object(name, rx).await.unwrap();
    }

    async fn seal_plain(container: &dyn Container, name: &str, db: &BackupInformationDatabase) {
        let plaintext = crate::bid::document::encode(db).unwrap();
        let mut bytes = ObjectHeader::plain().encode();
        bytes.extend_from_slice(&plaintext);
        upload_whole(container, name, bytes).await;
    }

    #[tokio::test]
    async fn recover_rebuilds_database_from_sole_sealed_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_string_lossy().to_string());
        let container = store.create_container("job").await.unwrap();

        let mut db = BackupInformationDatabase::new(Some("job".to_string()));
        db.append(SpecificBackupInformation::new(
            "job".to_string(),
            chrono::Utc::now(),
            BackupType::Full,
            [1u8; 32],
        ))
        .unwrap();
        seal_plain(container.as_ref(), "zz-backup-info-20260101-000000.atbuinf", &db).await;

        let recovered = recover(container.as_ref(), None).await.unwrap();
        assert_eq!(recovered.specific_backups.len(), 1);
        assert_eq!(recovered.backup_base_name, Some("job".to_string()));
    }

    #[tokio::test]
    async fn recover_picks_the_newest_of_several_sealed_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_string_lossy().to_string());
        let container = store.create_container("job").await.unwrap();

        let mut older = BackupInformationDatabase::new(None);
        older
            .append(SpecificBackupInformation::new(
                "job".to_string(),
                chrono::Utc::now(),
                BackupType::Full,
                [1u8; 32],
            ))
            .unwrap();
        seal_plain(container.as_ref(), "zz-backup-info-20260101-000000.atbuinf", &older).await;

        let mut newer = BackupInformationDatabase::new(None);
        newer
            .append(SpecificBackupInformation::new(
                "job".to_string(),
                chrono::Utc::now(),
                BackupType::Full,
                [2u8; 32],
            ))
            .unwrap();
        newer
            .append(SpecificBackupInformation::new(
                "job".to_string(),
                chrono::Utc::now(),
                BackupType::Incremental,
                [3u8; 32],
            ))
            .unwrap();
        seal_plain(container.as_ref(), "zz-backup-info-20260215-093000.atbuinf", &newer).await;

        let recovered = recover(container.as_ref(), None).await.unwrap();
        assert_eq!(recovered.specific_backups.len(), 2);
    }

    #[tokio::test]
    async fn recover_fails_when_no_sealed_object_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_string_lossy().to_string());
        let container = store.create_container("job").await.unwrap();

        let result = recover(container.as_ref(), None).await;
        assert!(matches!(result, Err(BackupError::BackupNotFound(_))));
    }

    #[tokio::test]
    async fn recover_decrypts_an_encrypted_sealed_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_string_lossy().to_string());
        let container = store.create_container("job").await.unwrap();

        let key = StaticKeyProvider::new([7u8; 32]).master_key().unwrap();
        let mut db = BackupInformationDatabase::new(None);
        db.append(SpecificBackupInformation::new(
            "job".to_string(),
            chrono::Utc::now(),
            BackupType::Full,
            [1u8; 32],
        ))
        .unwrap();

        let plaintext = crate::bid::document::encode(&db).unwrap();
        let iv = random_iv();
        let ciphertext = crate::crypto::encrypt(&key, &iv, &plaintext).unwrap();
        let mut bytes = ObjectHeader::with_iv(iv).encode();
        bytes.extend_from_slice(&ciphertext);
        upload_whole(container.as_ref(), "zz-backup-info-20260101-000000.atbuinfe", bytes).await;

        let without_key = recover(container.as_ref(), None).await;
        assert!(matches!(
            without_key,
            Err(BackupError::Encryption(EncryptionError::InvalidKey(_)))
        ));

        let recovered = recover(container.as_ref(), Some(&key)).await.unwrap();
        assert_eq!(recovered.specific_backups.len(), 1);
    }
}
