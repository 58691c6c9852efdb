//! Directory enumeration and tree operations
//!
//! [`Dir`] enumerates one directory with stat-field projection; the
//! module-level functions create and remove directories. Recursive removal
//! walks the tree once, deleting files as they are encountered and
//! directories afterwards in reverse discovery order, with working storage
//! recycled in batches sized from the platform page size.

use crate::perms::Perms;
use crate::pool::scratch;
use crate::stat::{FieldValue, StatField, StatRecord};
use crate::status::{Status, StatusCode};
use log::debug;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// An open directory enumeration. `.` and `..` are never reported.
pub struct Dir {
    path: PathBuf,
    iter: Mutex<fs::ReadDir>,
}

impl Dir {
    pub fn open(path: impl AsRef<Path>) -> Result<Dir, Status> {
        let path = path.as_ref().to_path_buf();
        let iter = fs::read_dir(&path)?;
        Ok(Dir {
            path,
            iter: Mutex::new(iter),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next entry's requested fields, or `None` at the end of the
    /// directory. With no fields requested, the full table is projected.
    pub fn read(&self, fields: &[StatField]) -> Result<Option<Vec<FieldValue>>, Status> {
        let entry = match self.iter.lock().next() {
            Some(entry) => entry?,
            None => return Ok(None),
        };
        let record = StatRecord::for_path(&entry.path(), fields)?;
        if fields.is_empty() {
            let values = record.table().into_iter().map(|(_, v)| v).collect();
            return Ok(Some(values));
        }
        Ok(Some(record.project(fields)))
    }

    /// Restart the enumeration from the first entry.
    pub fn rewind(&self) -> Result<(), Status> {
        *self.iter.lock() = fs::read_dir(&self.path)?;
        Ok(())
    }

    /// Iterator over entries, bound to this enumeration's position.
    pub fn entries<'a>(&'a self, fields: &'a [StatField]) -> Entries<'a> {
        Entries { dir: self, fields }
    }
}

impl std::fmt::Debug for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dir").field("path", &self.path).finish()
    }
}

/// Entry iterator returned by [`Dir::entries`].
#[derive(Debug)]
pub struct Entries<'a> {
    dir: &'a Dir,
    fields: &'a [StatField],
}

impl Iterator for Entries<'_> {
    type Item = Result<Vec<FieldValue>, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        self.dir.read(self.fields).transpose()
    }
}

/// Create a directory. Parent must exist.
pub fn make(path: &Path, perms: Option<Perms>) -> Result<(), Status> {
    scratch::with(|_| {
        fs::create_dir(path)?;
        if let Some(perms) = perms {
            crate::file::perms_set(path, perms)?;
        }
        Ok(())
    })
}

/// Create a directory and any missing parents. An existing directory is
/// success.
pub fn make_recursive(path: &Path, perms: Option<Perms>) -> Result<(), Status> {
    scratch::with(|_| {
        fs::create_dir_all(path)?;
        if let Some(perms) = perms {
            crate::file::perms_set(path, perms)?;
        }
        Ok(())
    })
}

/// Remove an empty directory.
pub fn remove(path: &Path) -> Result<(), Status> {
    scratch::with(|_| Ok(fs::remove_dir(path)?))
}

/// Entries per reused snapshot buffer, sized so the buffer stays within a
/// page or two of path storage.
fn removal_batch_size() -> usize {
    (page_size::get() / 64).max(16)
}

/// Remove a directory tree.
///
/// One walk deletes files as they are encountered and records directories
/// in discovery order (parents first); a second pass removes the
/// directories in reverse, children before parents. Each directory's
/// entries are snapshotted before anything is unlinked, since deleting
/// under an open enumeration cursor is platform-fragile; the snapshot
/// buffer is reused across directories and trimmed back to one batch.
pub fn remove_recursive(root: &Path) -> Result<(), Status> {
    let batch = removal_batch_size();
    let mut dirs: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut snapshot: Vec<(PathBuf, bool)> = Vec::new();
    let mut removed_files = 0usize;

    while let Some(dir) = pending.pop() {
        snapshot.clear();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            // DirEntry::file_type does not follow symlinks, so a symlinked
            // directory is unlinked, not descended into.
            snapshot.push((entry.path(), entry.file_type()?.is_dir()));
        }
        for (path, is_dir) in snapshot.drain(..) {
            if is_dir {
                dirs.push(path.clone());
                pending.push(path);
            } else {
                fs::remove_file(&path)?;
                removed_files += 1;
            }
        }
        if snapshot.capacity() > batch {
            snapshot.shrink_to(batch);
        }
    }

    for dir in dirs.iter().rev() {
        fs::remove_dir(dir)?;
    }
    debug!(
        "removed {} files and {} directories under {:?}",
        removed_files,
        dirs.len(),
        root
    );
    Ok(())
}

/// The system directory for temporary files.
pub fn temp_dir_get() -> Result<PathBuf, Status> {
    let dir = std::env::temp_dir();
    if dir.as_os_str().is_empty() {
        return Err(Status::new(
            StatusCode::Noent,
            "no temporary directory available",
        ));
    }
    Ok(dir)
}

/// The current working directory.
pub fn cwd_get() -> Result<PathBuf, Status> {
    Ok(std::env::current_dir()?)
}

/// Change the current working directory.
pub fn chdir(path: &Path) -> Result<(), Status> {
    Ok(std::env::set_current_dir(path)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stat::FileType;

    fn populate(root: &Path) {
        for d in 0..3 {
            let sub = root.join(format!("sub{d}"));
            fs::create_dir(&sub).unwrap();
            for f in 0..5 {
                fs::write(sub.join(format!("f{f}")), b"x").unwrap();
            }
        }
        fs::write(root.join("top"), b"y").unwrap();
    }

    #[test]
    fn enumeration_skips_dot_entries() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let d = Dir::open(dir.path()).unwrap();
        let mut names = Vec::new();
        for entry in d.entries(&[StatField::Name]) {
            match entry.unwrap().pop() {
                Some(FieldValue::Str(name)) => names.push(name),
                other => panic!("unexpected field {other:?}"),
            }
        }
        names.sort();
        assert_eq!(names, vec!["sub0", "sub1", "sub2", "top"]);
    }

    #[test]
    fn rewind_restarts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("only"), b"x").unwrap();
        let d = Dir::open(dir.path()).unwrap();
        assert!(d.read(&[StatField::Name]).unwrap().is_some());
        assert!(d.read(&[StatField::Name]).unwrap().is_none());
        d.rewind().unwrap();
        assert!(d.read(&[StatField::Name]).unwrap().is_some());
    }

    #[test]
    fn projection_reports_types() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let d = Dir::open(dir.path()).unwrap();
        let mut dirs = 0;
        let mut files = 0;
        for entry in d.entries(&[StatField::Type]) {
            match entry.unwrap().pop() {
                Some(FieldValue::Type(FileType::Directory)) => dirs += 1,
                Some(FieldValue::Type(FileType::File)) => files += 1,
                other => panic!("unexpected field {other:?}"),
            }
        }
        assert_eq!((dirs, files), (3, 1));
    }

    #[test]
    fn recursive_removal_takes_the_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        populate(&root);
        remove_recursive(&root).unwrap();
        assert!(!root.exists());
        let err = crate::stat::stat(&root, &[]).unwrap_err();
        assert_eq!(err.name(), "ENOENT");
    }

    #[test]
    fn make_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");
        make(&path, Some(Perms::parse("rwxr-x---").unwrap())).unwrap();
        assert!(path.is_dir());
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
