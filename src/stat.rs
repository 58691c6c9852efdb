//! File status projection
//!
//! `stat()` callers either name the fields they want, receiving the values
//! in order (with `Missing` for anything this platform cannot provide), or
//! name none and receive every available field as a table. Times are seconds
//! since the Unix epoch as `f64` with microsecond resolution.

use crate::perms::Perms;
use crate::status::Status;
use nix::sys::stat::FileStat;
use std::path::{Path, PathBuf};

/// What a directory entry or path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    File,
    Link,
    Pipe,
    Socket,
    BlockDevice,
    CharDevice,
    Unknown,
}

impl FileType {
    pub fn name(self) -> &'static str {
        match self {
            FileType::Directory => "directory",
            FileType::File => "file",
            FileType::Link => "link",
            FileType::Pipe => "pipe",
            FileType::Socket => "socket",
            FileType::BlockDevice => "block device",
            FileType::CharDevice => "character device",
            FileType::Unknown => "unknown",
        }
    }

    fn from_mode(mode: u32) -> FileType {
        match mode as libc::mode_t & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFREG => FileType::File,
            libc::S_IFLNK => FileType::Link,
            libc::S_IFIFO => FileType::Pipe,
            libc::S_IFSOCK => FileType::Socket,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFCHR => FileType::CharDevice,
            _ => FileType::Unknown,
        }
    }
}

/// A requestable stat field. `Link` is a pseudo-field: it requests that
/// symbolic links not be dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Name,
    Path,
    Type,
    User,
    Group,
    Size,
    CSize,
    CTime,
    ATime,
    MTime,
    NLink,
    Inode,
    Dev,
    Protection,
    Link,
}

impl StatField {
    pub fn parse(name: &str) -> Result<StatField, Status> {
        Ok(match name {
            "name" => StatField::Name,
            "path" => StatField::Path,
            "type" => StatField::Type,
            "user" => StatField::User,
            "group" => StatField::Group,
            "size" => StatField::Size,
            "csize" => StatField::CSize,
            "ctime" => StatField::CTime,
            "atime" => StatField::ATime,
            "mtime" => StatField::MTime,
            "nlink" => StatField::NLink,
            "inode" => StatField::Inode,
            "dev" => StatField::Dev,
            "protection" => StatField::Protection,
            "link" => StatField::Link,
            other => return Err(Status::invalid(format!("unknown stat field '{other}'"))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            StatField::Name => "name",
            StatField::Path => "path",
            StatField::Type => "type",
            StatField::User => "user",
            StatField::Group => "group",
            StatField::Size => "size",
            StatField::CSize => "csize",
            StatField::CTime => "ctime",
            StatField::ATime => "atime",
            StatField::MTime => "mtime",
            StatField::NLink => "nlink",
            StatField::Inode => "inode",
            StatField::Dev => "dev",
            StatField::Protection => "protection",
            StatField::Link => "link",
        }
    }

    /// Every real field, in table order.
    pub const ALL: [StatField; 14] = [
        StatField::Name,
        StatField::Path,
        StatField::Type,
        StatField::User,
        StatField::Group,
        StatField::Size,
        StatField::CSize,
        StatField::CTime,
        StatField::ATime,
        StatField::MTime,
        StatField::NLink,
        StatField::Inode,
        StatField::Dev,
        StatField::Protection,
    ];
}

/// One projected field value. `Missing` renders as `false` in sequence
/// contexts and is omitted from tables.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Num(f64),
    Type(FileType),
    Missing,
}

/// The result of a single stat call, ready for projection.
#[derive(Debug, Clone)]
pub struct StatRecord {
    path: PathBuf,
    stat: FileStat,
}

impl StatRecord {
    /// Stat `path`, following symlinks unless the requested fields include
    /// the `link` pseudo-field.
    pub fn for_path(path: &Path, fields: &[StatField]) -> Result<StatRecord, Status> {
        let stat = if fields.contains(&StatField::Link) {
            nix::sys::stat::lstat(path)?
        } else {
            nix::sys::stat::stat(path)?
        };
        Ok(StatRecord {
            path: path.to_path_buf(),
            stat,
        })
    }

    /// Stat an open descriptor.
    pub fn for_fd(fd: std::os::fd::RawFd, path: &Path) -> Result<StatRecord, Status> {
        let mut stat = std::mem::MaybeUninit::<FileStat>::uninit();
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(Status::from_errno(nix::errno::Errno::last()));
        }
        Ok(StatRecord {
            path: path.to_path_buf(),
            stat: unsafe { stat.assume_init() },
        })
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.stat.st_mode as u32)
    }

    fn field(&self, field: StatField) -> FieldValue {
        match field {
            StatField::Name => match self.path.file_name() {
                Some(name) => FieldValue::Str(name.to_string_lossy().into_owned()),
                None => FieldValue::Missing,
            },
            StatField::Path => FieldValue::Str(self.path.to_string_lossy().into_owned()),
            StatField::Type => FieldValue::Type(self.file_type()),
            StatField::User => match nix::unistd::User::from_uid(self.stat.st_uid.into()) {
                Ok(Some(user)) => FieldValue::Str(user.name),
                _ => FieldValue::Missing,
            },
            StatField::Group => match nix::unistd::Group::from_gid(self.stat.st_gid.into()) {
                Ok(Some(group)) => FieldValue::Str(group.name),
                _ => FieldValue::Missing,
            },
            StatField::Size => FieldValue::Num(self.stat.st_size as f64),
            StatField::CSize => FieldValue::Num((self.stat.st_blocks as f64) * 512.0),
            StatField::CTime => FieldValue::Num(time_secs(
                self.stat.st_ctime,
                self.stat.st_ctime_nsec,
            )),
            StatField::ATime => FieldValue::Num(time_secs(
                self.stat.st_atime,
                self.stat.st_atime_nsec,
            )),
            StatField::MTime => FieldValue::Num(time_secs(
                self.stat.st_mtime,
                self.stat.st_mtime_nsec,
            )),
            StatField::NLink => FieldValue::Num(self.stat.st_nlink as f64),
            StatField::Inode => FieldValue::Num(self.stat.st_ino as f64),
            StatField::Dev => FieldValue::Num(self.stat.st_dev as f64),
            StatField::Protection => {
                FieldValue::Str(Perms::from_mode(self.stat.st_mode as u32).format())
            }
            StatField::Link => FieldValue::Missing,
        }
    }

    /// Project the requested fields in order. The `link` pseudo-field is
    /// skipped; it only selects lstat.
    pub fn project(&self, fields: &[StatField]) -> Vec<FieldValue> {
        fields
            .iter()
            .filter(|field| **field != StatField::Link)
            .map(|field| self.field(*field))
            .collect()
    }

    /// Every available field as `(name, value)` pairs; missing fields are
    /// omitted.
    pub fn table(&self) -> Vec<(&'static str, FieldValue)> {
        StatField::ALL
            .into_iter()
            .filter_map(|field| match self.field(field) {
                FieldValue::Missing => None,
                value => Some((field.name(), value)),
            })
            .collect()
    }
}

/// Seconds since the epoch with microsecond resolution.
fn time_secs(secs: libc::time_t, nsec: libc::c_long) -> f64 {
    secs as f64 + (nsec / 1000) as f64 / 1e6
}

/// Stat a path, projecting the requested fields; with no fields, the full
/// table is produced via [`StatRecord::table`].
pub fn stat(path: &Path, fields: &[StatField]) -> Result<StatRecord, Status> {
    StatRecord::for_path(path, fields)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stat_field_names_round_trip() {
        for field in StatField::ALL {
            assert_eq!(StatField::parse(field.name()).unwrap(), field);
        }
        assert!(StatField::parse("bogus").is_err());
    }

    #[test]
    fn regular_file_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.txt");
        std::fs::write(&path, b"12345").unwrap();
        let record = stat(&path, &[]).unwrap();
        assert_eq!(record.file_type(), FileType::File);
        let values = record.project(&[StatField::Name, StatField::Size, StatField::Type]);
        assert_eq!(
            values,
            vec![
                FieldValue::Str("probe.txt".into()),
                FieldValue::Num(5.0),
                FieldValue::Type(FileType::File),
            ]
        );
    }

    #[test]
    fn missing_path_reports_noent() {
        let err = stat(Path::new("/no/such/path"), &[]).unwrap_err();
        assert_eq!(err.name(), "ENOENT");
    }

    #[test]
    fn link_pseudo_field_selects_lstat() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("alias");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let followed = stat(&link, &[StatField::Type]).unwrap();
        assert_eq!(followed.file_type(), FileType::File);
        let not_followed = stat(&link, &[StatField::Type, StatField::Link]).unwrap();
        assert_eq!(not_followed.file_type(), FileType::Link);
    }

    #[test]
    fn table_contains_protection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        std::fs::write(&path, b"").unwrap();
        let table = stat(&path, &[]).unwrap().table();
        assert!(table.iter().any(|(name, _)| *name == "protection"));
    }
}
