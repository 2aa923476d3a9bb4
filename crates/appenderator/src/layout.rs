//! Directory Lock & Layout: the advisory lock on the base persist
//! directory, and path computation for every on-disk artifact.

use std::{
    fs::OpenOptions,
    path::{
        Path,
        PathBuf,
    },
};

use fs4::FileExt;

use crate::{
    errors::ErrorMetadata,
    identifier::SegmentIdentifier,
};

pub const LOCK_FILE_NAME: &str = ".lock";
pub const IDENTIFIER_FILE_NAME: &str = "identifier.json";
pub const MERGED_DIR_NAME: &str = "merged";
pub const DESCRIPTOR_FILE_NAME: &str = "descriptor.json";

/// Holds the exclusive, non-blocking advisory lock on `base/.lock` for the
/// lifetime of one appenderator job.
/// Released only by `Appenderator::close`, never by `close_now`.
pub struct DirectoryLock {
    base: PathBuf,
    file: std::fs::File,
}

impl DirectoryLock {
    /// Creates the base directory if needed and acquires the lock.
    /// Failure to acquire (another appenderator is already running against
    /// this directory) is fatal.
    pub fn acquire(base: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)
            .map_err(|err| anyhow::anyhow!(err))
            .map_err(|err| err.context(format!("failed to create base persist directory {}", base.display())))?;
        let lock_path = base.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(anyhow::Error::from)?;
        file.try_lock_exclusive()
            .map_err(|_| {
                anyhow::anyhow!("another appenderator already holds the lock on {}", base.display())
                    .context(ErrorMetadata::lock_acquisition_failed(
                        "could not acquire the exclusive base persist directory lock",
                    ))
            })?;
        Ok(Self {
            base: base.to_path_buf(),
            file,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Releases the lock. Called only from `close`; `closeNow` deliberately
    /// leaves the lock held for the process to release on exit.
    pub fn release(self) -> anyhow::Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}

/// Filesystem-safe, unique-per-identifier subdirectory name under the base
/// persist directory.
pub fn sink_dir(base: &Path, identifier: &SegmentIdentifier) -> PathBuf {
    base.join(identifier.as_dir_name())
}

pub fn identifier_file(sink_dir: &Path) -> PathBuf {
    sink_dir.join(IDENTIFIER_FILE_NAME)
}

/// The Nth hydrant's spill subdirectory.
pub fn hydrant_dir(sink_dir: &Path, sequence: usize) -> PathBuf {
    sink_dir.join(sequence.to_string())
}

pub fn merged_dir(sink_dir: &Path) -> PathBuf {
    sink_dir.join(MERGED_DIR_NAME)
}

pub fn descriptor_file(sink_dir: &Path) -> PathBuf {
    sink_dir.join(DESCRIPTOR_FILE_NAME)
}

/// Lists the numeric hydrant spill subdirectories under `sink_dir` in
/// ascending numeric order. Non-numeric entries (`merged/`,
/// `descriptor.json`, `identifier.json`) are ignored. Used only at push
/// time, never to assign the next spill number.
pub fn numbered_hydrant_dirs(sink_dir: &Path) -> anyhow::Result<Vec<(usize, PathBuf)>> {
    let mut entries = Vec::new();
    let read_dir = match std::fs::read_dir(sink_dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err.into()),
    };
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(sequence) = name.parse::<usize>() {
            entries.push((sequence, entry.path()));
        }
    }
    entries.sort_by_key(|(sequence, _)| *sequence);
    Ok(entries)
}

/// Validates that spill subdirectory numbers form a contiguous `0..N-1`
/// sequence. A gap is a fatal on-disk corruption signal, never silently
/// tolerated.
pub fn assert_contiguous(entries: &[(usize, PathBuf)]) -> anyhow::Result<()> {
    for (expected, (actual, _)) in entries.iter().enumerate() {
        if expected != *actual {
            return Err(anyhow::anyhow!(
                "spill directories are not contiguous: expected {expected} but found {actual}"
            )
            .context(ErrorMetadata::sanity_violation(
                "hydrant spill numbering has a gap; on-disk state is corrupt",
            )));
        }
    }
    Ok(())
}

/// Lists every sink subdirectory under `base` (anything that is a
/// directory and contains an `identifier.json`), used by `push` to
/// enumerate sinks to reload from disk.
pub fn list_sink_dirs(base: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let read_dir = match std::fs::read_dir(base) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(err) => return Err(err.into()),
    };
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if identifier_file(&entry.path()).is_file() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_acquisition_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = DirectoryLock::acquire(dir.path()).unwrap();
        let second = DirectoryLock::acquire(dir.path());
        assert!(second.is_err());
        first.release().unwrap();
        assert!(DirectoryLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn contiguous_check_detects_gaps() {
        let entries = vec![(0, PathBuf::from("0")), (2, PathBuf::from("2"))];
        assert!(assert_contiguous(&entries).is_err());
        let entries = vec![(0, PathBuf::from("0")), (1, PathBuf::from("1"))];
        assert!(assert_contiguous(&entries).is_ok());
    }

    #[test]
    fn numbered_hydrant_dirs_ignores_non_numeric_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("0")).unwrap();
        std::fs::create_dir(dir.path().join("1")).unwrap();
        std::fs::create_dir(dir.path().join("merged")).unwrap();
        std::fs::write(dir.path().join("descriptor.json"), b"{}").unwrap();

        let entries = numbered_hydrant_dirs(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 0);
        assert_eq!(entries[1].0, 1);
    }
}
