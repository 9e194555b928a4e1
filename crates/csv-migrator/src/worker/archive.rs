//! File moves used when importing and rolling back imported CSVs.

use std::path::{Path, PathBuf};

use crate::error::WorkerError;

/// Moves `src` to `dst`, renaming when possible and falling back to copy
/// plus delete across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), WorkerError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let move_error = |e| WorkerError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    };
    std::fs::copy(src, dst).map_err(move_error)?;
    std::fs::remove_file(src).map_err(move_error)?;
    Ok(())
}

pub fn ensure_directory(path: &Path) -> Result<(), WorkerError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| WorkerError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// First free path for `filename` in `directory`, appending `_2`, `_3`, ...
/// before the extension when the name is taken.
pub fn resolve_conflict(directory: &Path, filename: &str) -> Result<PathBuf, WorkerError> {
    let path = directory.join(filename);
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(path);
    }

    let (base, ext) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], Some(&filename[dot..])),
        _ => (filename, None),
    };

    for counter in 2..=1000 {
        let candidate = match ext {
            Some(ext) => format!("{}_{}{}", base, counter, ext),
            None => format!("{}_{}", base, counter),
        };
        let candidate = directory.join(candidate);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }

    Err(WorkerError::FileExists(path))
}

/// Strips any directory components from a client supplied name.
pub fn safe_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("upload.csv")
        .to_string()
}

/// `<first 8 chars of job id>_<filename>`, the name archived files get.
pub fn job_file_name(job_id: &str, filename: &str) -> String {
    let prefix: String = job_id.chars().take(8).collect();
    format!("{}_{}", prefix, safe_filename(filename))
}
