//! The mounted filesystem the installers write to.
//!
//! The FAT driver itself is external; all this crate needs from a mount is its root
//! directory and how much space is left on it.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub trait Volume {
    fn root(&self) -> &Path;

    /// Free bytes on the volume.
    fn available_space(&self) -> Result<u64>;
}

/// Visit every regular file below `dir`, without recursion.
///
/// Entries that vanish or cannot be inspected mid-walk are skipped.
pub fn walk(dir: &Path, mut visit: impl FnMut(&Path, &fs::Metadata)) -> Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if current.as_path() == dir => return Err(Error::file(dir)(e)),
            Err(e) => {
                debug!("skipping {}: {}", current.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_file() {
                visit(&path, &metadata);
            } else if metadata.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(())
}

/// A mounted partition exposed as a host directory.
///
/// Free space is the partition capacity minus the size of every file on it.
#[derive(Clone, Debug)]
pub struct DirVolume {
    root: PathBuf,
    capacity: u64,
}

impl DirVolume {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self { root: root.into(), capacity }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_space(&self) -> Result<u64> {
        let mut used = 0u64;
        walk(&self.root, |_, metadata| used += metadata.len())?;
        Ok(used)
    }
}

impl Volume for DirVolume {
    fn root(&self) -> &Path {
        &self.root
    }

    fn available_space(&self) -> Result<u64> {
        Ok(self.capacity.saturating_sub(self.used_space()?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn free_space_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::write(dir.path().join("top.bin"), [0u8; 100]).unwrap();
        fs::write(dir.path().join("a/b/c/deep.bin"), [0u8; 400]).unwrap();
        fs::write(dir.path().join("a/mid.bin"), [0u8; 24]).unwrap();

        let volume = DirVolume::new(dir.path(), 1000);
        assert_eq!(volume.used_space().unwrap(), 524);
        assert_eq!(volume.available_space().unwrap(), 476);
        assert_eq!(DirVolume::new(dir.path(), 10).available_space().unwrap(), 0);
    }

    #[test]
    fn walk_visits_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/z"), b"z").unwrap();
        let mut seen = Vec::new();
        walk(dir.path(), |path, _| seen.push(path.to_path_buf())).unwrap();
        assert_eq!(seen, vec![dir.path().join("x/y/z")]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(DirVolume::new(dir.path().join("nope"), 1).used_space(), Err(Error::File { .. })));
    }
}
