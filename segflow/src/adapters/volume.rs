//! Helpers for recognising and listing volumetric (NIfTI) image files.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Recognised volumetric image suffixes, longest first.
pub const VOLUME_SUFFIXES: [&str; 2] = [".nii.gz", ".nii"];

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Returns true if the file name carries a volumetric suffix.
#[must_use]
pub fn is_volume_name(path: &Path) -> bool {
    volume_stem(path).is_some()
}

/// The file name with its volumetric suffix removed.
///
/// `study_T2_3.nii.gz` yields `study_T2_3`.
#[must_use]
pub fn volume_stem(path: &Path) -> Option<&str> {
    let name = file_name(path)?;
    VOLUME_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
}

/// Regular, non-hidden files directly inside `dir`, sorted by path.
///
/// Symbolic links to regular files are included.
pub fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = file_name(&path).is_some_and(|n| n.starts_with('.'));
        if !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Volumetric files directly inside `dir`, sorted by path.
pub fn list_volumes(dir: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(list_files(dir)?
        .into_iter()
        .filter(|p| is_volume_name(p))
        .collect())
}

/// Returns true if `dir` exists and contains at least one entry.
#[must_use]
pub fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Modification stamps of the files under a directory, taken before a tool
/// writes into it.
///
/// Files that were already present and are unchanged afterwards were not
/// produced by that invocation.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    stamps: HashMap<PathBuf, FileStamp>,
}

impl DirSnapshot {
    /// Records every file under `dir`, recursively.
    ///
    /// A missing directory yields an empty snapshot.
    pub fn capture(dir: &Path) -> io::Result<Self> {
        let mut snapshot = Self::default();
        if dir.is_dir() {
            snapshot.walk(dir)?;
        }
        Ok(snapshot)
    }

    fn walk(&mut self, dir: &Path) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path)?;
            } else if path.is_file() {
                let stamp = FileStamp::of(&path)?;
                self.stamps.insert(path, stamp);
            }
        }
        Ok(())
    }

    /// Number of files recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Returns true if no file was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Returns true if `path` is new or has changed since the snapshot.
    #[must_use]
    pub fn is_fresh(&self, path: &Path) -> bool {
        match self.stamps.get(path) {
            None => true,
            Some(before) => FileStamp::of(path).is_ok_and(|now| now != *before),
        }
    }

    /// Splits `files` into `(fresh, stale)`, keeping their order.
    #[must_use]
    pub fn partition(&self, files: Vec<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
        files.into_iter().partition(|path| self.is_fresh(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_stem() {
        assert_eq!(volume_stem(Path::new("/a/study.nii.gz")), Some("study"));
        assert_eq!(volume_stem(Path::new("T2_sag_3.nii")), Some("T2_sag_3"));
        assert_eq!(volume_stem(Path::new("study.json")), None);
        assert_eq!(volume_stem(Path::new(".nii.gz")), None);
        assert!(!is_volume_name(Path::new("study.nii.gz.bak")));
    }

    #[test]
    fn test_list_volumes_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.nii.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("a.nii"), b"x").unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(".hidden.nii"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested.nii")).unwrap();

        let volumes = list_volumes(dir.path()).unwrap();
        assert_eq!(volumes, vec![dir.path().join("a.nii"), dir.path().join("b.nii.gz")]);
        assert_eq!(list_files(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_dir_has_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!dir_has_entries(dir.path()));
        assert!(!dir_has_entries(&dir.path().join("missing")));

        std::fs::write(dir.path().join("weights.pth"), b"x").unwrap();
        assert!(dir_has_entries(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_files_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("store/T2_sag_3.nii.gz");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"x").unwrap();
        let input = dir.path().join("input");
        std::fs::create_dir(&input).unwrap();
        std::os::unix::fs::symlink(&target, input.join("T2_sag_3.nii.gz")).unwrap();

        assert_eq!(list_volumes(&input).unwrap(), vec![input.join("T2_sag_3.nii.gz")]);
    }

    #[test]
    fn test_snapshot_separates_new_files_from_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("step2_output/previous.nii.gz");
        std::fs::create_dir_all(old.parent().unwrap()).unwrap();
        std::fs::write(&old, b"old").unwrap();

        let snapshot = DirSnapshot::capture(dir.path()).unwrap();
        assert_eq!(snapshot.len(), 1);

        let new = dir.path().join("step2_output/current.nii.gz");
        std::fs::write(&new, b"new").unwrap();

        let (fresh, stale) = snapshot.partition(vec![new.clone(), old.clone()]);
        assert_eq!(fresh, vec![new]);
        assert_eq!(stale, vec![old.clone()]);

        std::fs::write(&old, b"rewritten by this run").unwrap();
        assert!(snapshot.is_fresh(&old));
    }

    #[test]
    fn test_snapshot_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DirSnapshot::capture(&dir.path().join("missing")).unwrap();

        assert!(snapshot.is_empty());
        assert!(snapshot.is_fresh(&dir.path().join("missing/a.nii.gz")));
    }
}
