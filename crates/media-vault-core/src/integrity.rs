//! Consistency check between the content tree on disk and the catalog.
//!
//! Meant to run while the library is idle: an upload in flight looks like a
//! temp entry, and a store racing the check can show up as a mismatch.

use rayon::prelude::*;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::content_store::ContentStore;
use crate::error::{Error, Result};
use crate::gateway::FileGateway;
use crate::hasher::{self, ContentHash};
use crate::layout::{CONTENT_DIR, DATA_FILE, TEMP_DIR};

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityOptions {
    pub repair: bool,
    /// Staging entries younger than this are assumed to be live uploads.
    pub stale_after: Duration,
}

impl Default for IntegrityOptions {
    fn default() -> Self {
        Self {
            repair: false,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCountMismatch {
    pub hash: ContentHash,
    pub recorded: i64,
    /// Media records that actually point at the content.
    pub actual: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    /// Bytes that no longer hash to the name they are stored under.
    pub corrupt: Vec<ContentHash>,
    /// Entries in the content tree that no catalog record accounts for,
    /// relative to the storage root.
    pub orphans: Vec<PathBuf>,
    /// Referenced content whose bytes are gone.
    pub missing: Vec<ContentHash>,
    pub stale_temp: Vec<PathBuf>,
    pub zero_ref: Vec<ContentHash>,
    pub mismatches: Vec<RefCountMismatch>,
    pub repaired: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
            && self.orphans.is_empty()
            && self.missing.is_empty()
            && self.stale_temp.is_empty()
            && self.zero_ref.is_empty()
            && self.mismatches.is_empty()
    }
}

#[derive(Debug, Default)]
struct ContentScan {
    /// Hash directories holding a data file, relative to the root.
    stored: Vec<(ContentHash, PathBuf)>,
    unknown: Vec<PathBuf>,
    stale_temp: Vec<PathBuf>,
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    path.metadata()
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

/// Walk `content/`. Expected shape is `ab/cd/<hash>/data` plus `temp/<id>/`.
fn scan_content(root: &Path, stale_after: Duration) -> io::Result<ContentScan> {
    let content_root = root.join(CONTENT_DIR);
    let mut scan = ContentScan::default();
    if !content_root.is_dir() {
        return Ok(scan);
    }

    for entry in WalkDir::new(&content_root).min_depth(1).max_depth(3) {
        let entry = entry.map_err(|err| {
            io::Error::new(io::ErrorKind::Other, format!("content walk failed: {}", err))
        })?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
        let parts: Vec<String> = entry
            .path()
            .strip_prefix(&content_root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let is_dir = entry.file_type().is_dir();

        if parts.first().map(String::as_str) == Some(TEMP_DIR) {
            if parts.len() == 2 && is_stale(entry.path(), stale_after) {
                scan.stale_temp.push(relative);
            }
            continue;
        }

        match (parts.len(), is_dir) {
            (1, true) | (2, true) => {}
            (3, true) => match ContentHash::parse(&parts[2]) {
                Some(hash)
                    if hash.shard() == (parts[0].as_str(), parts[1].as_str())
                        && entry.path().join(DATA_FILE).is_file() =>
                {
                    scan.stored.push((hash, relative));
                }
                _ => scan.unknown.push(relative),
            },
            _ => scan.unknown.push(relative),
        }
    }

    Ok(scan)
}

/// Re-hash every stored file in parallel. Returns the hashes whose bytes no
/// longer match.
fn find_corrupt(root: &Path, stored: &[(ContentHash, PathBuf)]) -> Vec<ContentHash> {
    let mut corrupt: Vec<ContentHash> = stored
        .par_iter()
        .filter_map(|(hash, dir)| {
            let data = root.join(dir).join(DATA_FILE);
            match hasher::verify_file(&data, hash) {
                Ok(true) => None,
                Ok(false) => {
                    warn!("Content {} does not match its bytes", hash);
                    Some(hash.clone())
                }
                Err(err) => {
                    warn!("Could not re-hash {}: {}", data.display(), err);
                    Some(hash.clone())
                }
            }
        })
        .collect();
    corrupt.sort();
    corrupt
}

pub async fn check_integrity(
    gateway: &FileGateway,
    catalog: &Catalog,
    store: &ContentStore,
    options: IntegrityOptions,
) -> Result<IntegrityReport> {
    let root = gateway.root().to_path_buf();
    let stale_after = options.stale_after;
    let (scan, corrupt) = tokio::task::spawn_blocking(move || -> io::Result<_> {
        let scan = scan_content(&root, stale_after)?;
        let corrupt = find_corrupt(&root, &scan.stored);
        Ok((scan, corrupt))
    })
    .await
    .map_err(|err| Error::Other(format!("integrity scan failed: {}", err)))??;

    let mut report = IntegrityReport {
        checked: scan.stored.len(),
        corrupt,
        stale_temp: scan.stale_temp,
        orphans: scan.unknown,
        ..IntegrityReport::default()
    };

    let on_disk: HashSet<&ContentHash> = scan.stored.iter().map(|(hash, _)| hash).collect();
    let records = catalog.with(|db| {
        db.list_content()?
            .into_iter()
            .map(|record| -> Result<_> {
                let actual = db.count_media_with_hash(&record.hash)?;
                Ok((record, actual))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut known: HashSet<ContentHash> = HashSet::new();
    for (record, actual) in records {
        if record.ref_count > 0 && !on_disk.contains(&record.hash) {
            report.missing.push(record.hash.clone());
        }
        if record.ref_count != actual {
            report.mismatches.push(RefCountMismatch {
                hash: record.hash.clone(),
                recorded: record.ref_count,
                actual,
            });
        } else if record.ref_count == 0 {
            report.zero_ref.push(record.hash.clone());
        }
        known.insert(record.hash);
    }
    for (hash, dir) in &scan.stored {
        if !known.contains(hash) {
            report.orphans.push(dir.clone());
        }
    }
    report.orphans.sort();

    info!(
        "Integrity check: {} files, {} corrupt, {} orphans, {} missing, {} stale temp, {} zero-ref, {} mismatched",
        report.checked,
        report.corrupt.len(),
        report.orphans.len(),
        report.missing.len(),
        report.stale_temp.len(),
        report.zero_ref.len(),
        report.mismatches.len()
    );

    if options.repair {
        report.repaired = repair(gateway, store, &report).await?;
    }
    Ok(report)
}

/// Remove orphans and stale staging, drop unreferenced records and reset
/// wrong counts. Corrupt and missing content is only reported.
async fn repair(
    gateway: &FileGateway,
    store: &ContentStore,
    report: &IntegrityReport,
) -> Result<usize> {
    let mut repaired = 0;
    for path in report.orphans.iter().chain(report.stale_temp.iter()) {
        debug!("Removing {}", path.display());
        gateway.delete_file(path).await?;
        repaired += 1;
    }
    for hash in &report.zero_ref {
        store.reconcile(hash, 0).await?;
        repaired += 1;
    }
    for mismatch in &report.mismatches {
        store.reconcile(&mismatch.hash, mismatch.actual).await?;
        repaired += 1;
    }
    if repaired > 0 {
        info!("Integrity repair fixed {} entries", repaired);
    }
    Ok(repaired)
}
