// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZIP archive engine for capture workspaces.
//!
//! [`archive`] packs a live workspace into `target_dir/<name>.zip` with
//! paths stored relative to the source root, then runs post-archive checks
//! (file exists, non-empty, opens cleanly, CRC pass) before the caller is
//! allowed to purge the source. [`clean`] empties a flat live directory for
//! the next run.

#![deny(unsafe_code)]

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Errors produced while creating, verifying, or cleaning an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The source path is missing or not a directory.
    #[error("source {0} is not a directory")]
    SourceNotADirectory(PathBuf),

    /// The target path is missing or not a directory.
    #[error("target {0} is not a directory")]
    TargetNotADirectory(PathBuf),

    /// An underlying filesystem operation failed.
    #[error("archive io error: {0}")]
    Io(#[from] io::Error),

    /// Walking the source tree failed.
    #[error("failed to walk source directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// The zip writer or reader reported a structural error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Post-archive verification failed; the archive must not be trusted.
    #[error("archive {archive} is corrupt: {reason}")]
    Corrupt {
        /// Path of the failed archive.
        archive: PathBuf,
        /// What the verification step observed.
        reason: String,
    },
}

/// Archive `source_dir` into `target_dir/<name>.zip` and verify the result.
///
/// Every file under `source_dir` is stored under its path relative to
/// `source_dir`, compressed with DEFLATE. Empty directories are not
/// preserved; live workspaces are flat. Returns the path of the verified
/// archive.
pub fn archive(name: &str, source_dir: &Path, target_dir: &Path) -> Result<PathBuf, ArchiveError> {
    if !source_dir.is_dir() {
        return Err(ArchiveError::SourceNotADirectory(source_dir.to_path_buf()));
    }
    if !target_dir.is_dir() {
        return Err(ArchiveError::TargetNotADirectory(target_dir.to_path_buf()));
    }

    let archive_path = target_dir.join(format!("{name}.zip"));
    let mut writer = ZipWriter::new(File::create(&archive_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| ArchiveError::Corrupt {
                archive: archive_path.clone(),
                reason: format!("entry {} escapes the source root: {e}", entry.path().display()),
            })?;
        let arc_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!(file = %entry.path().display(), entry = %arc_name, "adding to archive");
        writer.start_file(arc_name, options)?;
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut writer)?;
    }
    writer.finish()?;

    verify(&archive_path)?;
    Ok(archive_path)
}

/// Run the post-archive sanity checks on `archive`.
///
/// The archive must exist, be non-empty, open as a zip, and every entry
/// must read back with a passing CRC.
pub fn verify(archive: &Path) -> Result<(), ArchiveError> {
    let corrupt = |reason: String| ArchiveError::Corrupt {
        archive: archive.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(archive)
        .map_err(|e| corrupt(format!("archive was not created: {e}")))?;
    if metadata.len() == 0 {
        return Err(corrupt("archive reports a size of 0".into()));
    }

    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|e| corrupt(format!("not a valid zip: {e}")))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| corrupt(format!("entry {index} is unreadable: {e}")))?;
        let name = entry.name().to_string();
        // Reading to EOF forces the stored CRC to be checked.
        if let Err(e) = io::copy(&mut entry, &mut io::sink()) {
            return Err(corrupt(format!("entry {name} failed the CRC check: {e}")));
        }
    }
    debug!(archive = %archive.display(), "archive integrity check passed");
    Ok(())
}

/// Remove every top-level entry of `source_dir` to prepare the next run.
///
/// Live directories are flat; entries are removed non-recursively.
pub fn clean(source_dir: &Path) -> Result<(), ArchiveError> {
    if !source_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(source_dir)? {
        let path = entry?.path();
        debug!(file = %path.display(), "removing");
        std::fs::remove_file(&path)?;
    }
    Ok(())
}
