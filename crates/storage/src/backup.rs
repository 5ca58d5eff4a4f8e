use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::db::SqliteLedger;
use crate::error::StoreError;

const DB_ENTRY: &str = "gastos.db";
const METADATA_ENTRY: &str = "backup_metadata.json";
const PREFIX: &str = "backup_";
const SUFFIX: &str = ".tar.gz";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: NaiveDateTime,
    #[serde(rename = "type")]
    pub kind: String,
    pub transactions: i64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub metadata: BackupMetadata,
}

/// Writes `backup_<kind>_<timestamp>.tar.gz` holding a consistent snapshot
/// of the database and a metadata entry, then prunes all but the newest
/// `keep` archives.
pub async fn create_backup(
    ledger: &SqliteLedger,
    backup_dir: &Path,
    kind: &str,
    keep: usize,
    now: NaiveDateTime,
) -> Result<BackupInfo, StoreError> {
    tokio::fs::create_dir_all(backup_dir).await?;

    let stamp = now.format("%Y%m%d_%H%M%S");
    let snapshot = backup_dir.join(format!(".snapshot_{stamp}.db"));
    if tokio::fs::try_exists(&snapshot).await? {
        tokio::fs::remove_file(&snapshot).await?;
    }
    ledger.snapshot_to(&snapshot).await?;
    let transactions = ledger.count().await?;

    let archive = backup_dir.join(format!("{PREFIX}{kind}_{stamp}{SUFFIX}"));
    let kind = kind.to_string();
    let dir = backup_dir.to_path_buf();

    let info = tokio::task::spawn_blocking(move || -> Result<BackupInfo, StoreError> {
        let result = write_archive(&snapshot, &archive, kind, transactions, now);
        std::fs::remove_file(&snapshot)?;
        let info = result?;
        prune(&dir, keep)?;
        Ok(info)
    })
    .await??;

    tracing::info!(
        path = %info.path.display(),
        size = info.size_bytes,
        transactions = info.metadata.transactions,
        "Backup created"
    );
    Ok(info)
}

fn write_archive(
    snapshot: &Path,
    archive: &Path,
    kind: String,
    transactions: i64,
    timestamp: NaiveDateTime,
) -> Result<BackupInfo, StoreError> {
    let sha256 = file_sha256(snapshot)?;
    let metadata = BackupMetadata {
        timestamp,
        kind,
        transactions,
        sha256,
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata)?;

    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_path_with_name(snapshot, DB_ENTRY)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(metadata_json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(timestamp.and_utc().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, METADATA_ENTRY, metadata_json.as_slice())?;
    builder.into_inner()?.finish()?;

    Ok(BackupInfo {
        path: archive.to_path_buf(),
        size_bytes: std::fs::metadata(archive)?.len(),
        metadata,
    })
}

fn file_sha256(path: &Path) -> Result<String, StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Archive paths in `dir`, newest first. Timestamped names sort
/// chronologically within a kind.
fn archives(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(PREFIX) && name.ends_with(SUFFIX) {
            // Sort on the timestamp suffix so auto and manual backups interleave.
            let stamp = name[..name.len() - SUFFIX.len()]
                .rsplitn(3, '_')
                .take(2)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("_");
            found.push((stamp, path));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

fn prune(dir: &Path, keep: usize) -> Result<(), StoreError> {
    for old in archives(dir)?.into_iter().skip(keep.max(1)) {
        tracing::info!("Removing old backup: {}", old.display());
        std::fs::remove_file(old)?;
    }
    Ok(())
}

/// Reads the metadata entry and checks the stored database against its
/// recorded checksum.
pub fn verify_backup(archive: &Path) -> Result<BackupMetadata, StoreError> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    let mut metadata: Option<BackupMetadata> = None;
    let mut db_digest: Option<String> = None;

    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        match name.as_str() {
            METADATA_ENTRY => metadata = Some(serde_json::from_reader(&mut entry)?),
            DB_ENTRY => {
                let mut hasher = Sha256::new();
                std::io::copy(&mut entry, &mut hasher)?;
                db_digest = Some(hex::encode(hasher.finalize()));
            }
            _ => {}
        }
    }

    let corrupt = |reason: &str| StoreError::Corrupt {
        id: archive.display().to_string(),
        reason: reason.to_string(),
    };
    let metadata = metadata.ok_or_else(|| corrupt("missing metadata"))?;
    match db_digest {
        Some(digest) if digest == metadata.sha256 => Ok(metadata),
        Some(_) => Err(corrupt("checksum mismatch")),
        None => Err(corrupt("missing database")),
    }
}

pub fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for path in archives(dir)? {
        match verify_backup(&path) {
            Ok(metadata) => out.push(BackupInfo {
                size_bytes: std::fs::metadata(&path)?.len(),
                path,
                metadata,
            }),
            Err(e) => tracing::warn!("Skipping unreadable backup {}: {e}", path.display()),
        }
    }
    Ok(out)
}
