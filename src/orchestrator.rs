//! Backup orchestrator (spec 4.5): discover → stat refresh → prefilter →
//! hash → decide → compress → upload → seal. Replaces the teacher's
//! `BackupOrchestrator` (`backup.rs`) semantics while keeping its
//! top-level struct name and "config holds managers" shape, and its
//! per-extension compression statistics kept in a `dashmap`-guarded
//! shared table (the teacher already depends on `dashmap`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use glob::Pattern;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::bid::{
    BackupFileInformation, BackupInformationDatabase, BackupType, DeduplicationOption,
    SpecificBackupInformation,
};
use crate::codec::{ObjectHeader, Preamble, PreambleCompression};
use crate::crypto::MasterKey;
use crate::error::{BackupError, Result, StorageError};
use crate::hasher::{FileHasher, PRIMARY_ALGORITHM};
use crate::pipeline::{
    default_pool_workers, pipe_channel, Pipeline, PipeSender, Stage, StageKind, StageSpec,
    WorkItem, MAX_SIMULTANEOUS_FILE_BACKUPS,
};
use crate::storage::{chunk_channel, Container, ObjectStore};

use async_trait::async_trait;
use bytes::Bytes;

/// Minimum file size eligible for compression (spec 4.5 step 7).
pub const DEFAULT_MIN_COMPRESS_SIZE: u64 = 150;
/// Running-average ratio above which an extension is considered
/// incompressible (spec 4.5 step 7).
pub const DEFAULT_POOR_RATIO_THRESHOLD: f64 = 0.9;
/// Number of poor outcomes required before an extension is skipped (spec
/// 4.5 step 7).
pub const DEFAULT_POOR_OUTCOME_COUNT: u32 = 3;
/// Initial upload retry backoff (spec 4.5 step 8, spec 7).
pub const INITIAL_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Maximum upload retry backoff.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
/// Object-name collision disambiguation budget (spec 4.5 step 8).
pub const MAX_NAME_COLLISION_ATTEMPTS: u32 = 1000;
/// Container auto-create / drain-timeout budget for pipeline shutdown.
pub const PIPELINE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn default_no_compress_regex() -> Regex {
    Regex::new(r"(?i)\.(jpe?g|png|gif|webp|mp3|mp4|mov|avi|mkv|zip|gz|tgz|7z|rar|bz2|xz|heic|docx?|xlsx?|pptx?)$")
        .expect("built-in no-compress regex is valid")
}

#[cfg(target_os = "windows")]
fn is_platform_excluded_dir(name: &str) -> bool {
    matches!(name, "System Volume Information" | "$Recycle.Bin")
}

#[cfg(not(target_os = "windows"))]
fn is_platform_excluded_dir(_name: &str) -> bool {
    false
}

/// Per-file-extension running compression statistics, shared across
/// upload workers (spec 5 "Shared-resource policy").
#[derive(Debug, Clone, Default)]
struct ExtensionStats {
    samples: u32,
    poor_count: u32,
    running_avg_ratio: f64,
}

impl ExtensionStats {
    fn record(&mut self, ratio: f64, poor_threshold: f64) {
        self.running_avg_ratio =
            (self.running_avg_ratio * self.samples as f64 + ratio) / (self.samples as f64 + 1.0);
        self.samples += 1;
        if ratio > poor_threshold {
            self.poor_count += 1;
        }
    }
}

/// Configuration for one backup session (spec 4.5, spec 3 SBI fields).
#[derive(Clone)]
pub struct BackupConfig {
    pub backup_base_name: String,
    pub sources: Vec<PathBuf>,
    pub backup_type: BackupType,
    pub dedup: DeduplicationOption,
    pub excludes: Vec<String>,
    pub detect_bitrot: bool,
    pub compression_enabled: bool,
    pub dry_run: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_base_name: "backup".to_string(),
            sources: Vec::new(),
            backup_type: BackupType::Full,
            dedup: DeduplicationOption::None,
            excludes: Vec::new(),
            detect_bitrot: true,
            compression_enabled: true,
            dry_run: false,
        }
    }
}

/// End-of-session report (spec 7).
#[derive(Debug, Clone, Default)]
pub struct BackupSessionReport {
    pub total_files: u64,
    pub unchanged_skipped: u64,
    pub backup_operations: u64,
    pub errors: u64,
    pub bytes: u64,
    pub successful_backups: u64,
    pub per_extension_compression_ratio: std::collections::HashMap<String, f64>,
    pub anomalies: Vec<String>,
}

impl BackupSessionReport {
    /// CLI exit code contract (spec 6): 0 on success, 1 on anomalies, 99
    /// on dry-run success. The core reports the non-dry-run codes; the
    /// dry-run code is applied by the caller when `dry_run` was set.
    pub fn exit_code(&self) -> i32 {
        if self.errors > 0 || !self.anomalies.is_empty() {
            1
        } else {
            0
        }
    }
}

/// A released-on-drop exclusive lease over a destination, guarding
/// against two processes backing up to the same storage definition at
/// once (spec 5 "Shared-resource policy", spec 7 "Concurrent-use
/// error").
pub struct DestinationLock {
    path: PathBuf,
}

impl DestinationLock {
    pub fn acquire(lease_dir: &Path, destination_id: &str) -> Result<Self> {
        std::fs::create_dir_all(lease_dir)?;
        let path = lease_dir.join(format!("{}.lock", destination_id));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                BackupError::BackupAlreadyInUse(destination_id.to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Walk `roots`, applying glob excludes and platform-specific excludes
/// (spec 4.5 step 1). Returns absolute file paths only (directories are
/// not yielded).
pub fn discover(roots: &[PathBuf], excludes: &[String]) -> Vec<PathBuf> {
    let patterns: Vec<Pattern> = excludes
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    let mut out = Vec::new();
    for root in roots {
        walk(root, &patterns, &mut out);
    }
    out
}

fn walk(dir: &Path, patterns: &[Pattern], out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to read directory during discovery");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_platform_excluded_dir(&name) {
            continue;
        }
        if patterns.iter().any(|p| p.matches_path(&path) || p.matches(&name)) {
            continue;
        }
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => walk(&path, patterns, out),
            Ok(ft) if ft.is_file() => out.push(path),
            _ => {}
        }
    }
}

fn stat_to_epoch_secs(time: std::io::Result<std::time::SystemTime>) -> f64 {
    time.ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Subprocess-bound hashing stage (spec 4.5 step 5, spec 4.1).
struct HashStage {
    hasher: FileHasher,
}

#[async_trait]
impl Stage for HashStage {
    fn name(&self) -> &str {
        "hash"
    }

    fn is_for_stage(&self, item: &WorkItem) -> bool {
        !item.is_failed && !item.bfi.is_unchanged_since_last
    }

    async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
        match self.hasher.hash_file(&item.source_path) {
            Ok((digest, size, modified)) => {
                item.bfi.digests.insert(PRIMARY_ALGORITHM.to_string(), digest);
                item.bfi.size_in_bytes = size;
                item.bfi.modified_time = modified;
                item.bfi.accessed_time = stat_to_epoch_secs(
                    std::fs::metadata(&item.source_path).and_then(|m| m.accessed()),
                );
            }
            Err(e) => item.fail(e.to_string()),
        }
        item
    }
}

/// Thread-bound decision stage (spec 4.5 step 6, spec 4.6 query
/// contracts). Consults the shared BID to short-circuit unchanged or
/// duplicate files and to flag sneaky corruption.
struct DecisionStage {
    bid: Arc<AsyncMutex<BackupInformationDatabase>>,
    dedup: DeduplicationOption,
    detect_bitrot: bool,
    anomalies: Arc<AsyncMutex<Vec<String>>>,
}

#[async_trait]
impl Stage for DecisionStage {
    fn name(&self) -> &str {
        "decision"
    }

    fn is_for_stage(&self, item: &WorkItem) -> bool {
        !item.is_failed && !item.bfi.is_unchanged_since_last
    }

    async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
        let db = self.bid.lock().await;

        if self.detect_bitrot {
            let (suspected, _) = db.sneaky_corruption(&item.bfi);
            if suspected {
                let message = format!(
                    "sneaky corruption suspected for '{}': size/mtime unchanged but digest differs",
                    item.bfi.path_without_root
                );
                drop(db);
                self.anomalies.lock().await.push(message);
                return item;
            }
        }

        if self.dedup != DeduplicationOption::None {
            if let Some(dup_ref) = db.duplicate(self.dedup, &item.bfi) {
                item.bfi.is_unchanged_since_last = true;
                item.bfi.backing_fi = Some(dup_ref);
                item.bfi.is_successful = true;
            }
            return item;
        }

        let (changed, _) = db.digest_changed(&item.bfi);
        if !changed {
            item.bfi.is_unchanged_since_last = true;
            item.bfi.is_successful = true;
        }
        item
    }
}

/// Subprocess-bound, pipe-producing compression stage (spec 4.5 step 7,
/// spec 4.4 "Pipe-connected stages"). Spawns a background task that
/// signals its compress/no-compress decision over the pipe, then either
/// streams gzip chunks or drops the pipe so the upload stage reads the
/// source file itself.
struct CompressionStage {
    enabled: bool,
    no_compress: Regex,
    min_size: u64,
    poor_ratio_threshold: f64,
    poor_outcome_count: u32,
    stats: Arc<DashMap<String, ExtensionStats>>,
}

impl CompressionStage {
    fn should_compress(&self, fi: &BackupFileInformation) -> bool {
        if !self.enabled || fi.size_in_bytes < self.min_size {
            return false;
        }
        if self.no_compress.is_match(&fi.path_without_root) {
            return false;
        }
        if let Some(stats) = self.stats.get(fi.extension()) {
            if stats.poor_count >= self.poor_outcome_count
                && stats.running_avg_ratio > self.poor_ratio_threshold
            {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Stage for CompressionStage {
    fn name(&self) -> &str {
        "compression"
    }

    fn is_for_stage(&self, item: &WorkItem) -> bool {
        !item.is_failed && !item.bfi.is_unchanged_since_last
    }

    async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
        let compress = self.should_compress(&item.bfi);
        let (tx, rx) = pipe_channel();
        item.pipe_rx = Some(rx);

        let source_path = item.source_path.clone();
        let ext = item.bfi.extension().to_string();
        let stats = self.stats.clone();
        let poor_ratio_threshold = self.poor_ratio_threshold;

        tokio::spawn(async move {
            if let Err(e) =
                run_compression_pipe(&source_path, compress, &tx, &stats, &ext, poor_ratio_threshold).await
            {
                tracing::warn!(path = %source_path.display(), error = %e, "compression pipe task failed");
            }
        });
        item
    }
}

async fn run_compression_pipe(
    path: &Path,
    compress: bool,
    tx: &PipeSender,
    stats: &DashMap<String, ExtensionStats>,
    ext: &str,
    poor_ratio_threshold: f64,
) -> Result<()> {
    tx.send_control(compress).await?;
    if !compress {
        return Ok(());
    }

    let file = std::fs::File::open(path)?;
    let original_size = file.metadata()?.len().max(1);
    let mut encoder = flate2::read::GzEncoder::new(file, flate2::Compression::default());
    let mut compressed_size: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        use std::io::Read;
        let n = encoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        compressed_size += n as u64;
        tx.send_chunk(Bytes::copy_from_slice(&buf[..n])).await?;
    }
    tx.send_eof().await?;

    let ratio = compressed_size as f64 / original_size as f64;
    stats
        .entry(ext.to_string())
        .or_default()
        .record(ratio, poor_ratio_threshold);
    Ok(())
}

/// Subprocess-bound upload stage (spec 4.5 step 8): assembles the header,
/// preamble, and (optionally encrypted) body and uploads it, retrying
/// transient storage errors with exponential backoff.
struct UploadStage {
    store: Arc<dyn ObjectStore>,
    container_name: String,
    key: Option<MasterKey>,
    salt: [u8; 32],
    reserved_names: Arc<AsyncMutex<HashSet<String>>>,
}

impl UploadStage {
    async fn candidate_name(&self, fi: &BackupFileInformation, extension: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(fi.path_without_root.as_bytes());
        let base = hex::encode(hasher.finalize());

        let mut reserved = self.reserved_names.lock().await;
        for attempt in 0..MAX_NAME_COLLISION_ATTEMPTS {
            let candidate = if attempt == 0 {
                format!("{}{}", base, extension)
            } else {
                format!("{}-{:03}{}", base, attempt, extension)
            };
            if reserved.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(BackupError::Unknown(format!(
            "could not find an unused object name for '{}' after {} attempts",
            fi.path_without_root, MAX_NAME_COLLISION_ATTEMPTS
        )))
    }

    async fn upload_with_retry(
        &self,
        container: &dyn Container,
        name: &str,
        body: &[u8],
    ) -> Result<()> {
        let chunk_size = container.upload_chunk_size();

        let mut backoff = INITIAL_RETRY_BACKOFF;
        loop {
            // A fresh reader task per attempt: `Bytes` is a cheap refcounted
            // view over `body`'s owned copy, so the producer can feed the
            // bounded queue without re-reading the source.
            let owned = Bytes::copy_from_slice(body);
            let (tx, rx) = chunk_channel();
            let reader = tokio::spawn(async move {
                let mut offset = 0;
                while offset < owned.len() {
                    let end = (offset + chunk_size).min(owned.len());
                    if tx.send(owned.slice(offset..end)).await.is_err() {
                        break;
                    }
                    offset = end;
                }
            });

            match container.upload_stream_to_object(name, rx).await {
                Ok(_) => {
                    let _ = reader.await;
                    return Ok(());
                }
                Err(e) if self.store.is_retryable(&e) => {
                    let _ = reader.await;
                    tracing::warn!(name, backoff_ms = %backoff.as_millis(), "retrying upload after transient storage error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(e) => {
                    let _ = reader.await;
                    let _ = container.delete_object(name).await;
                    return Err(e.into());
                }
            }
        }
    }

    async fn upload(&self, item: &mut WorkItem) -> Result<()> {
        let (body, compression) = if let Some(mut rx) = item.pipe_rx.take() {
            let comp_via_pipe = rx.recv_control().await?;
            if comp_via_pipe {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv_chunk().await? {
                    buf.extend_from_slice(&chunk);
                }
                (buf, PreambleCompression::Gzip)
            } else {
                (std::fs::read(&item.source_path)?, PreambleCompression::None)
            }
        } else {
            (std::fs::read(&item.source_path)?, PreambleCompression::None)
        };

        let digest = item
            .bfi
            .primary_digest()
            .ok_or_else(|| BackupError::InvalidState("upload attempted before hashing".to_string()))?
            .to_string();

        let preamble = Preamble {
            compression,
            digest_algorithm: PRIMARY_ALGORITHM.to_string(),
            digest_hex: digest,
            size: item.bfi.size_in_bytes,
            modified: item.bfi.modified_time,
            accessed: item.bfi.accessed_time,
            path_without_root: item.bfi.path_without_root.clone(),
        };

        let mut plaintext = preamble.encode()?;
        plaintext.extend_from_slice(&body);

        let (object_bytes, extension) = if let Some(key) = &self.key {
            let iv = crate::crypto::random_iv();
            let ciphertext = crate::crypto::encrypt(key, &iv, &plaintext)?;
            let mut ciphertext_hasher = Sha256::new();
            ciphertext_hasher.update(&ciphertext);
            item.bfi.is_backup_encrypted = true;
            item.bfi.encryption_iv = Some(iv);
            item.bfi.ciphertext_hash_during_backup = Some(hex::encode(ciphertext_hasher.finalize()));

            let mut out = ObjectHeader::with_iv(iv).encode();
            out.extend_from_slice(&ciphertext);
            (out, ".atbake")
        } else {
            let mut out = ObjectHeader::plain().encode();
            out.extend_from_slice(&plaintext);
            (out, ".atbak")
        };

        let container = self.store.get_container(&self.container_name).await?;
        let name = self.candidate_name(&item.bfi, extension).await?;
        self.upload_with_retry(container.as_ref(), &name, &object_bytes).await?;

        item.bfi.storage_object_name = Some(name);
        item.bfi.is_successful = true;
        Ok(())
    }
}

#[async_trait]
impl Stage for UploadStage {
    fn name(&self) -> &str {
        "upload"
    }

    fn is_for_stage(&self, item: &WorkItem) -> bool {
        !item.is_failed && !item.bfi.is_unchanged_since_last
    }

    async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
        if let Err(e) = self.upload(&mut item).await {
            item.fail(e.to_string());
        }
        item
    }
}

/// The top-level backup orchestrator (spec 4.5).
pub struct BackupOrchestrator {
    config: BackupConfig,
    store: Arc<dyn ObjectStore>,
    container_name: String,
    key: Option<MasterKey>,
    lease_dir: PathBuf,
}

impl BackupOrchestrator {
    pub fn new(
        config: BackupConfig,
        store: Arc<dyn ObjectStore>,
        container_name: impl Into<String>,
        key: Option<MasterKey>,
        lease_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            store,
            container_name: container_name.into(),
            key,
            lease_dir,
        }
    }

    /// Run one full backup session against `existing_bid` (spec 4.5,
    /// steps 1-9). Returns the updated BID and the session's report; the
    /// caller is responsible for persisting the BID (spec 4.6 "Saving").
    pub async fn run(
        &self,
        mut existing_bid: BackupInformationDatabase,
    ) -> Result<(BackupInformationDatabase, SpecificBackupInformation, BackupSessionReport)> {
        let _lock = DestinationLock::acquire(&self.lease_dir, &self.config.backup_base_name)?;

        let mut salt = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
        let start_time = chrono::Utc::now();
        let mut sbi = SpecificBackupInformation::new(
            self.config.backup_base_name.clone(),
            start_time,
            self.config.backup_type,
            salt,
        );

        let discovered = discover(&self.config.sources, &self.config.excludes);
        let mut report = BackupSessionReport::default();
        report.total_files = discovered.len() as u64;

        let mut initial_items = Vec::with_capacity(discovered.len());
        for path in discovered {
            let discovery_root = self
                .config
                .sources
                .iter()
                .find(|root| path.starts_with(root))
                .cloned()
                .unwrap_or_else(|| path.clone());

            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    report.errors += 1;
                    report.anomalies.push(format!("stat failed for '{}': {}", path.display(), e));
                    continue;
                }
            };

            let path_without_root = path.to_string_lossy().to_string();
            let mut bfi = BackupFileInformation::new(
                path.to_string_lossy().to_string(),
                path_without_root.clone(),
                discovery_root.to_string_lossy().to_string(),
            );
            bfi.size_in_bytes = meta.len();
            bfi.modified_time = stat_to_epoch_secs(meta.modified());
            bfi.accessed_time = stat_to_epoch_secs(meta.accessed());
            bfi.deduplication_option = self.config.dedup;

            if self.config.backup_type == BackupType::Incremental {
                if let Some(prior) = existing_bid.most_recent_for_path(&path_without_root) {
                    if prior.size_in_bytes == bfi.size_in_bytes && prior.modified_time == bfi.modified_time {
                        bfi.digests = prior.digests.clone();
                        bfi.is_backing_fi_digest = true;
                        bfi.is_unchanged_since_last = true;
                        bfi.is_successful = true;
                        // Counted once, in `record_result`, when this item comes
                        // back out of the pipeline below — stages all gate on
                        // `!is_unchanged_since_last` and pass it through untouched.
                    }
                }
            }

            initial_items.push(WorkItem::new(bfi, path));
        }

        if self.config.dry_run {
            for item in initial_items {
                if item.bfi.is_unchanged_since_last {
                    report.unchanged_skipped += 1;
                }
                sbi.all_file_info.push(item.bfi);
            }
            return Ok((existing_bid, sbi, report));
        }

        let bid = Arc::new(AsyncMutex::new(std::mem::take(&mut existing_bid)));
        let anomalies = Arc::new(AsyncMutex::new(Vec::new()));
        let stats: Arc<DashMap<String, ExtensionStats>> = Arc::new(DashMap::new());

        let hash_stage = Arc::new(HashStage {
            hasher: FileHasher::default(),
        });
        let decision_stage = Arc::new(DecisionStage {
            bid: bid.clone(),
            dedup: self.config.dedup,
            detect_bitrot: self.config.detect_bitrot
                && self.config.backup_type != BackupType::Incremental,
            anomalies: anomalies.clone(),
        });
        let compression_stage = Arc::new(CompressionStage {
            enabled: self.config.compression_enabled,
            no_compress: default_no_compress_regex(),
            min_size: DEFAULT_MIN_COMPRESS_SIZE,
            poor_ratio_threshold: DEFAULT_POOR_RATIO_THRESHOLD,
            poor_outcome_count: DEFAULT_POOR_OUTCOME_COUNT,
            stats: stats.clone(),
        });
        let upload_stage = Arc::new(UploadStage {
            store: self.store.clone(),
            container_name: self.container_name.clone(),
            key: self.key.clone(),
            salt,
            reserved_names: Arc::new(AsyncMutex::new(HashSet::new())),
        });

        let mut pipeline = Pipeline::build(vec![
            StageSpec::new(StageKind::Subprocess, hash_stage)
                .with_queue_depth(MAX_SIMULTANEOUS_FILE_BACKUPS),
            StageSpec::new(StageKind::Thread, decision_stage).with_workers(default_pool_workers()),
            StageSpec::new(StageKind::SubprocessPiped, compression_stage),
            StageSpec::new(StageKind::Subprocess, upload_stage),
        ]);

        // The first stage's bounded queue depth (MAX_SIMULTANEOUS_FILE_BACKUPS)
        // is the backpressure mechanism (spec 4.4 "Concurrency contract"):
        // submission blocks once that many items are in flight.
        let pending = initial_items.len();
        for item in initial_items {
            pipeline.submit(item).await?;
        }

        for _ in 0..pending {
            if let Some(item) = pipeline.recv().await {
                record_result(&mut report, &item.bfi, item.is_failed, item.anomaly);
                sbi.all_file_info.push(item.bfi);
            }
        }

        pipeline.shutdown(PIPELINE_DRAIN_TIMEOUT).await?;

        report.anomalies.extend(anomalies.lock().await.drain(..));
        report.per_extension_compression_ratio = stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().running_avg_ratio))
            .collect();

        sbi.all_file_info.sort_by(|a, b| a.normalized_path_key().cmp(&b.normalized_path_key()));

        let mut final_bid = Arc::try_unwrap(bid)
            .map_err(|_| BackupError::InvalidState("BID still shared at session end".to_string()))?
            .into_inner();
        final_bid.append(sbi.clone())?;

        self.seal(&final_bid, start_time).await?;

        Ok((final_bid, sbi, report))
    }

    /// Upload the finalized BID itself as an object (spec 4.5 step 9), so
    /// `recovery::recover` can rebuild a lost local BID from the store
    /// alone. Named `zz-backup-info-<timestamp>.atbuinf[e]`; the `zz-`
    /// prefix sorts BID objects after ordinary content objects when a
    /// container is listed.
    async fn seal(&self, bid: &BackupInformationDatabase, timestamp: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let plaintext = crate::bid::document::encode(bid)?;
        let name_stem = format!("zz-backup-info-{}", timestamp.format("%Y%m%d-%H%M%S"));

        let (object_bytes, name) = if let Some(key) = &self.key {
            let iv = crate::crypto::random_iv();
            let ciphertext = crate::crypto::encrypt(key, &iv, &plaintext)?;
            let mut out = ObjectHeader::with_iv(iv).encode();
            out.extend_from_slice(&ciphertext);
            (out, format!("{}.atbuinfe", name_stem))
        } else {
            let mut out = ObjectHeader::plain().encode();
            out.extend_from_slice(&plaintext);
            (out, format!("{}.atbuinf", name_stem))
        };

        let container = self.store.get_container(&self.container_name).await?;
        let chunk_size = container.upload_chunk_size();

        let mut backoff = INITIAL_RETRY_BACKOFF;
        loop {
            let (tx, rx) = chunk_channel();
            let owned = Bytes::copy_from_slice(&object_bytes);
            let reader = tokio::spawn(async move {
                let mut offset = 0;
                while offset < owned.len() {
                    let end = (offset + chunk_size).min(owned.len());
                    if tx.send(owned.slice(offset..end)).await.is_err() {
                        break;
                    }
                    offset = end;
                }
            });

            match container.upload_stream_to_object(&name, rx).await {
                Ok(_) => {
                    let _ = reader.await;
                    return Ok(());
                }
                Err(e) if self.store.is_retryable(&e) => {
                    let _ = reader.await;
                    tracing::warn!(name = %name, backoff_ms = %backoff.as_millis(), "retrying BID seal upload after transient storage error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(e) => {
                    let _ = reader.await;
                    return Err(e.into());
                }
            }
        }
    }
}

fn record_result(report: &mut BackupSessionReport, bfi: &BackupFileInformation, failed: bool, anomaly: Option<String>) {
    if bfi.is_unchanged_since_last {
        report.unchanged_skipped += 1;
        return;
    }
    if failed {
        report.errors += 1;
        if let Some(a) = anomaly {
            report.anomalies.push(a);
        }
        return;
    }
    report.backup_operations += 1;
    if bfi.is_successful {
        report.successful_backups += 1;
        report.bytes += bfi.size_in_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_lock_rejects_concurrent_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let first = DestinationLock::acquire(dir.path(), "job").unwrap();
        let second = DestinationLock::acquire(dir.path(), "job");
        assert!(matches!(second, Err(BackupError::BackupAlreadyInUse(_))));
        drop(first);
        assert!(DestinationLock::acquire(dir.path(), "job").is_ok());
    }

    #[test]
    fn discover_applies_glob_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"hi").unwrap();

        let found = discover(&[dir.path().to_path_buf()], &["*.jpg".to_string()]);
        assert_eq!(found.len(), 1);
        assert!(found[0].to_string_lossy().ends_with("a.txt"));
    }

    #[test]
    fn extension_stats_track_running_average_and_poor_count() {
        let mut stats = ExtensionStats::default();
        stats.record(0.95, 0.9);
        stats.record(0.97, 0.9);
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.poor_count, 2);
        assert!(stats.running_avg_ratio > 0.9);
    }

    #[test]
    fn no_compress_regex_matches_common_media_extensions() {
        let re = default_no_compress_regex();
        assert!(re.is_match("photo.JPG"));
        assert!(re.is_match("archive.zip"));
        assert!(!re.is_match("notes.txt"));
    }

    #[test]
    fn record_result_counts_unchanged_item_exactly_once() {
        // An incremental-prefiltered unchanged item still flows through every
        // pipeline stage (they all gate on `!is_unchanged_since_last` and
        // pass it through), so `record_result` at `recv()` time must be the
        // only place this counter is touched.
        let mut bfi = BackupFileInformation::new(
            "/src/a.txt".to_string(),
            "/src/a.txt".to_string(),
            "/src".to_string(),
        );
        bfi.is_unchanged_since_last = true;
        bfi.is_successful = true;

        let mut report = BackupSessionReport::default();
        record_result(&mut report, &bfi, false, None);

        assert_eq!(report.unchanged_skipped, 1);
        assert_eq!(report.backup_operations, 0);
        assert_eq!(report.successful_backups, 0);
    }
}
