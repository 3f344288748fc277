//! Synchronous file I/O executed on the file worker thread.
//!
//! Every request opens its own handle and releases it when the handle drops,
//! on the error path included. Two handles on the same path at once is the
//! caller's problem; the gateway coalesces reads for that reason.

use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::channel::{ProgressEmitter, UploadProgress};
use crate::error::{WorkerError, WorkerErrorKind};
use crate::hasher::{ContentHash, StreamingHasher};
use crate::layout::StorageLayout;

#[derive(Debug)]
pub enum FileRequest {
    Save { path: PathBuf, bytes: Bytes },
    Get { path: PathBuf },
    Delete { path: PathBuf },
    List { dir: PathBuf },
    ProcessUpload { source: UploadSource },
    SaveUpload { source: UploadSource, path: PathBuf },
}

impl FileRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            FileRequest::Save { .. } => "save",
            FileRequest::Get { .. } => "get",
            FileRequest::Delete { .. } => "delete",
            FileRequest::List { .. } => "list",
            FileRequest::ProcessUpload { .. } => "process_upload",
            FileRequest::SaveUpload { .. } => "save_upload",
        }
    }
}

/// Where upload bytes come from: a user file streamed from disk, or bytes
/// already in memory.
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Bytes(Bytes),
}

impl UploadSource {
    fn open(&self) -> io::Result<(Box<dyn Read + Send>, u64)> {
        match self {
            UploadSource::File(path) => {
                let file = File::open(path)?;
                let size = file.metadata()?.len();
                Ok((Box::new(file), size))
            }
            UploadSource::Bytes(bytes) => {
                Ok((Box::new(Cursor::new(bytes.clone())), bytes.len() as u64))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// `None` for `SaveUpload`, which skips hashing.
    pub hash: Option<ContentHash>,
    pub size: u64,
    /// Final location, relative to the storage root.
    pub path: PathBuf,
    /// The content path was already occupied, so the staged copy was discarded.
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub enum FilePayload {
    Unit,
    Bytes(Bytes),
    Listing(Vec<DirEntry>),
    Upload(UploadReceipt),
}

pub type FileResponse = Result<FilePayload, WorkerError>;

pub struct FileWorker {
    root: PathBuf,
    chunk_size: usize,
    handle_opens: Arc<AtomicUsize>,
}

impl FileWorker {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize, handle_opens: Arc<AtomicUsize>) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(4096),
            handle_opens,
        }
    }

    pub fn handle(
        &mut self,
        request: FileRequest,
        progress: &ProgressEmitter<'_, FileResponse>,
    ) -> FileResponse {
        let kind = request.kind();
        let result = match request {
            FileRequest::Save { path, bytes } => self.save(&path, &bytes).map(|_| FilePayload::Unit),
            FileRequest::Get { path } => self.get(&path).map(FilePayload::Bytes),
            FileRequest::Delete { path } => self.delete(&path).map(|_| FilePayload::Unit),
            FileRequest::List { dir } => self.list(&dir).map(FilePayload::Listing),
            FileRequest::ProcessUpload { source } => self
                .process_upload(&source, &|p| progress.emit(p))
                .map(FilePayload::Upload),
            FileRequest::SaveUpload { source, path } => self
                .save_upload(&source, &path, &|p| progress.emit(p))
                .map(FilePayload::Upload),
        };
        if let Err(err) = &result {
            debug!("file worker: {} failed: {}", kind, err);
        }
        result
    }

    /// Map a root-relative path onto disk, refusing anything that escapes the root.
    fn resolve(&self, relative: &Path) -> Result<PathBuf, WorkerError> {
        let escapes = relative.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if escapes || relative.as_os_str().is_empty() {
            return Err(WorkerError::new(
                WorkerErrorKind::InvalidPath,
                format!("path '{}' is not inside the storage root", relative.display()),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn open(&self, path: &Path, options: &OpenOptions) -> Result<File, WorkerError> {
        self.handle_opens.fetch_add(1, Ordering::SeqCst);
        options
            .open(path)
            .map_err(|err| WorkerError::with_path(err, path))
    }

    fn ensure_parent(path: &Path) -> Result<(), WorkerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| WorkerError::with_path(err, parent))?;
        }
        Ok(())
    }

    pub fn save(&self, relative: &Path, bytes: &[u8]) -> Result<(), WorkerError> {
        let path = self.resolve(relative)?;
        Self::ensure_parent(&path)?;
        let mut file = self.open(
            &path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|err| WorkerError::with_path(err, &path))?;
        trace!("file worker: saved {} bytes to {}", bytes.len(), relative.display());
        Ok(())
    }

    pub fn get(&self, relative: &Path) -> Result<Bytes, WorkerError> {
        let path = self.resolve(relative)?;
        let mut file = self.open(&path, OpenOptions::new().read(true))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|err| WorkerError::with_path(err, &path))?;
        Ok(Bytes::from(buffer))
    }

    /// Removes a file or a whole directory. A missing entry is not an error.
    pub fn delete(&self, relative: &Path) -> Result<(), WorkerError> {
        let path = self.resolve(relative)?;
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                trace!("file worker: {} already absent", relative.display());
                return Ok(());
            }
            Err(err) => return Err(WorkerError::with_path(err, &path)),
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(WorkerError::with_path(err, &path)),
        }

        self.prune_empty_parents(&path);
        Ok(())
    }

    /// Walk up from a removed entry deleting directories left empty, stopping
    /// at the first non-empty one or the root.
    fn prune_empty_parents(&self, removed: &Path) {
        let mut current = removed.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir only succeeds on empty directories.
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    pub fn list(&self, relative: &Path) -> Result<Vec<DirEntry>, WorkerError> {
        let path = self.resolve(relative)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(WorkerError::with_path(err, &path)),
        };

        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| WorkerError::with_path(err, &path))?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("file worker: skipping {}: {}", entry.path().display(), err);
                    continue;
                }
            };
            listing.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Stream into a staging file while hashing, then move the result to its
    /// content-addressed path.
    pub fn process_upload(
        &self,
        source: &UploadSource,
        progress: &dyn Fn(UploadProgress),
    ) -> Result<UploadReceipt, WorkerError> {
        let temp_id = Uuid::new_v4().simple().to_string();
        let temp_dir = self.resolve(&StorageLayout::temp_dir(&temp_id))?;
        let temp_path = self.resolve(&StorageLayout::temp_path(&temp_id))?;

        let streamed = self.stream_to(source, &temp_path, true, progress);
        let (size, hash) = match streamed {
            Ok((size, Some(hash))) => (size, hash),
            Ok((_, None)) => {
                let _ = fs::remove_dir_all(&temp_dir);
                return Err(WorkerError::new(
                    WorkerErrorKind::Unexpected,
                    "upload finished without a digest",
                ));
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&temp_dir);
                return Err(err);
            }
        };

        let final_relative = StorageLayout::content_path(&hash);
        let final_path = self.resolve(&final_relative)?;
        let already_present = final_path.exists();

        let moved = if already_present {
            fs::remove_file(&temp_path)
        } else {
            Self::ensure_parent(&final_path)?;
            fs::rename(&temp_path, &final_path)
        };
        if let Err(err) = moved {
            let _ = fs::remove_dir_all(&temp_dir);
            return Err(WorkerError::with_path(err, &final_path));
        }
        let _ = fs::remove_dir_all(&temp_dir);

        debug!(
            "file worker: stored {} bytes as {} (already present: {})",
            size, hash, already_present
        );
        Ok(UploadReceipt {
            hash: Some(hash),
            size,
            path: final_relative,
            already_present,
        })
    }

    /// Same streaming write as an upload, without hashing.
    pub fn save_upload(
        &self,
        source: &UploadSource,
        relative: &Path,
        progress: &dyn Fn(UploadProgress),
    ) -> Result<UploadReceipt, WorkerError> {
        let path = self.resolve(relative)?;
        let (size, _) = self.stream_to(source, &path, false, progress)?;
        Ok(UploadReceipt {
            hash: None,
            size,
            path: relative.to_path_buf(),
            already_present: false,
        })
    }

    fn stream_to(
        &self,
        source: &UploadSource,
        destination: &Path,
        hash: bool,
        progress: &dyn Fn(UploadProgress),
    ) -> Result<(u64, Option<ContentHash>), WorkerError> {
        let (mut reader, total) = source.open()?;
        Self::ensure_parent(destination)?;
        let mut file = self.open(
            destination,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;

        let copied = Self::copy_chunks(
            &mut reader,
            &mut file,
            destination,
            total,
            hash,
            self.chunk_size,
            progress,
        );
        if copied.is_err() {
            drop(file);
            // A partial destination must not look like a finished upload.
            if let Err(err) = fs::remove_file(destination) {
                warn!("Failed to remove partial upload {}: {}", destination.display(), err);
            }
        }
        copied
    }

    fn copy_chunks(
        reader: &mut dyn Read,
        file: &mut File,
        destination: &Path,
        total: u64,
        hash: bool,
        chunk_size: usize,
        progress: &dyn Fn(UploadProgress),
    ) -> Result<(u64, Option<ContentHash>), WorkerError> {
        let mut hasher = hash.then(StreamingHasher::new);
        let mut buffer = vec![0u8; chunk_size];
        let mut written: u64 = 0;

        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            let chunk = &buffer[..read];
            file.write_all(chunk)
                .map_err(|err| WorkerError::with_path(err, destination))?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(chunk);
            }
            written += read as u64;
            progress(UploadProgress {
                bytes_written: written,
                percent: percent_of(written, total),
            });
        }

        file.sync_all()
            .map_err(|err| WorkerError::with_path(err, destination))?;
        Ok((written, hasher.map(|h| h.finalize())))
    }
}

fn percent_of(written: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (written as f64 / total as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn worker(root: &Path) -> FileWorker {
        FileWorker::new(root, 4096, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_save_creates_intermediate_directories() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        worker.save(Path::new("a/b/c/file.bin"), b"hello").unwrap();
        assert_eq!(fs::read(dir.path().join("a/b/c/file.bin")).unwrap(), b"hello");
        assert_eq!(worker.get(Path::new("a/b/c/file.bin")).unwrap(), &b"hello"[..]);
    }

    #[test]
    fn test_delete_missing_entry_is_ok() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        worker.delete(Path::new("content/never/was")).unwrap();
    }

    #[test]
    fn test_delete_prunes_empty_shard_directories() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        worker.save(Path::new("content/ab/cd/abcd/data"), b"x").unwrap();
        worker.save(Path::new("content/ab/ef/abef/data"), b"y").unwrap();

        worker.delete(Path::new("content/ab/cd/abcd")).unwrap();
        assert!(!dir.path().join("content/ab/cd").exists());
        assert!(dir.path().join("content/ab/ef/abef/data").exists());
    }

    #[test]
    fn test_resolve_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        let err = worker.get(Path::new("../etc/passwd")).unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::InvalidPath);
        let err = worker.save(Path::new("/abs/path"), b"x").unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::InvalidPath);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = worker(dir.path()).get(Path::new("nope.bin")).unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::NotFound);
    }

    #[test]
    fn test_list_sorted_and_missing_dir_empty() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        worker.save(Path::new("proxies/b/meta.json"), b"{}").unwrap();
        worker.save(Path::new("proxies/a/meta.json"), b"{}").unwrap();
        worker.save(Path::new("proxies/top.txt"), b"123").unwrap();

        let listing = worker.list(Path::new("proxies")).unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "top.txt"]);
        assert!(listing[0].is_dir);
        assert_eq!(listing[2].size, 3);

        assert!(worker.list(Path::new("exports")).unwrap().is_empty());
    }

    #[test]
    fn test_process_upload_moves_to_sharded_path_and_reports_progress() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let seen = Mutex::new(Vec::new());

        let receipt = worker
            .process_upload(&UploadSource::Bytes(Bytes::from(data.clone())), &|p| {
                seen.lock().unwrap().push(p)
            })
            .unwrap();

        let expected_hash = hash_bytes(&data);
        assert_eq!(receipt.hash.as_ref(), Some(&expected_hash));
        assert_eq!(receipt.size, data.len() as u64);
        assert_eq!(receipt.path, StorageLayout::content_path(&expected_hash));
        assert!(!receipt.already_present);
        assert_eq!(fs::read(dir.path().join(&receipt.path)).unwrap(), data);

        // 10_000 bytes in 4096-byte chunks: three progress events, last at 100%.
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().bytes_written, 10_000);
        assert!((seen.last().unwrap().percent - 100.0).abs() < f64::EPSILON);

        // Staging area is cleaned up.
        let temp_root = dir.path().join(StorageLayout::temp_root());
        assert_eq!(fs::read_dir(&temp_root).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[test]
    fn test_process_upload_of_existing_content_discards_staged_copy() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        let source = UploadSource::Bytes(Bytes::from_static(b"same bytes"));

        let first = worker.process_upload(&source, &|_| {}).unwrap();
        let second = worker.process_upload(&source, &|_| {}).unwrap();
        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn test_save_upload_streams_file_without_hash() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("source.mov");
        fs::write(&source_path, vec![7u8; 9000]).unwrap();
        let root = dir.path().join("root");
        let worker = worker(&root);

        let receipt = worker
            .save_upload(
                &UploadSource::File(source_path),
                Path::new("exports/m/source.mov"),
                &|_| {},
            )
            .unwrap();
        assert!(receipt.hash.is_none());
        assert_eq!(receipt.size, 9000);
        assert_eq!(fs::read(root.join("exports/m/source.mov")).unwrap().len(), 9000);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_save_upload_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let worker = worker(dir.path());
        // Opening a directory succeeds on Linux; reading from it does not.
        let unreadable = dir.path().join("not-a-file");
        fs::create_dir_all(&unreadable).unwrap();

        let result = worker.save_upload(
            &UploadSource::File(unreadable),
            Path::new("exports/m1/clip.mp4"),
            &|_| {},
        );
        assert!(result.is_err());
        assert!(!dir.path().join("exports/m1/clip.mp4").exists());
    }

    #[test]
    fn test_every_request_opens_its_own_handle() {
        let dir = tempdir().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let worker = FileWorker::new(dir.path(), 4096, Arc::clone(&opens));
        worker.save(Path::new("x.bin"), b"1").unwrap();
        worker.get(Path::new("x.bin")).unwrap();
        worker.get(Path::new("x.bin")).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }
}
