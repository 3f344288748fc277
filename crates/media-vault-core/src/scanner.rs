use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::config::non_overlapping_directories;
use crate::mime;

/// Parallel directory traversal. Builds a map of MIME type → files, keeping
/// only supported media and skipping ignored paths, symlinks and empty files.
pub fn build_mime_to_files_map(
    root_paths: &[PathBuf],
    ignore_globs: &[String],
) -> io::Result<DashMap<&'static str, Vec<PathBuf>>> {
    let map: DashMap<&'static str, Vec<PathBuf>> = DashMap::new();

    let ignore_patterns: Vec<Pattern> = ignore_globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    let roots = non_overlapping_directories(root_paths.to_vec());
    roots
        .par_iter()
        .try_for_each(|root_dir| visit_dirs(root_dir, root_dir, &map, &ignore_patterns))?;

    Ok(map)
}

/// Every importable file under `root_paths`, in path order.
pub fn collect_media_files(
    root_paths: &[PathBuf],
    ignore_globs: &[String],
) -> io::Result<Vec<PathBuf>> {
    let map = build_mime_to_files_map(root_paths, ignore_globs)?;
    let mut files: Vec<PathBuf> = map.into_iter().flat_map(|(_, paths)| paths).collect();
    files.sort();
    debug!("Found {} media files", files.len());
    Ok(files)
}

/// Ignore patterns are matched against paths relative to `root`.
fn visit_dirs(
    root: &Path,
    dir: &Path,
    map: &DashMap<&'static str, Vec<PathBuf>>,
    ignore_patterns: &[Pattern],
) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let relative = dir.strip_prefix(root).unwrap_or(dir);
    if ignore_patterns
        .iter()
        .any(|pattern| pattern.matches_path(relative))
    {
        return Ok(());
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(
                    "Access denied reading directory {}: {}",
                    dir.display(),
                    err
                );
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = entry_result.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error reading entry in directory {}: {}", dir.display(), err),
            )
        })?;

        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error getting metadata for {}: {}", path.display(), err),
            )
        })?;

        if metadata.is_dir() {
            visit_dirs(root, &path, map, ignore_patterns)?;
        } else if metadata.is_file() && metadata.len() > 0 {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let ignored = ignore_patterns
                .iter()
                .any(|pattern| pattern.matches_path(relative));
            let mime_type = path
                .file_name()
                .and_then(|name| mime::mime_from_file_name(&name.to_string_lossy()));
            if let (false, Some(mime_type)) = (ignored, mime_type) {
                map.entry(mime_type).or_default().push(path);
            }
        }
        Ok::<(), io::Error>(())
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collects_supported_non_empty_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("day1/audio")).unwrap();
        fs::write(root.join("day1/a.mp4"), b"v").unwrap();
        fs::write(root.join("day1/audio/b.wav"), b"a").unwrap();
        fs::write(root.join("day1/notes.txt"), b"t").unwrap();
        fs::write(root.join("day1/empty.mov"), b"").unwrap();
        fs::write(root.join("day1/.hidden.mp4"), b"h").unwrap();

        let files =
            collect_media_files(&[root.to_path_buf()], &["**/.*".to_string()]).unwrap();
        assert_eq!(
            files,
            vec![root.join("day1/a.mp4"), root.join("day1/audio/b.wav")]
        );
    }

    #[test]
    fn test_groups_by_mime_type() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.jpg"), b"1").unwrap();
        fs::write(dir.path().join("y.jpeg"), b"2").unwrap();
        fs::write(dir.path().join("z.png"), b"3").unwrap();

        let map = build_mime_to_files_map(&[dir.path().to_path_buf()], &[]).unwrap();
        assert_eq!(map.get("image/jpeg").unwrap().len(), 2);
        assert_eq!(map.get("image/png").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let files = collect_media_files(&[dir.path().join("nope")], &[]).unwrap();
        assert!(files.is_empty());
    }
}
