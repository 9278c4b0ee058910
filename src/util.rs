use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{FsError, Result};

/// Work around an annoyance in Rust's standard traits -- if you define
/// TryFrom<&str>, then you probably also want TryFrom<String> and FromStr,
/// and the implementation is trivial in terms of TryFrom<&str>. So this macro
/// just generates the boilerplate for you.
#[macro_export]
macro_rules! try_from_str_boilerplate {
    ($name:ident) => {
        impl std::convert::TryFrom<String> for $name {
            type Error = $crate::error::FsError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                (&*s).try_into()
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::FsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.try_into()
            }
        }
    };
}

pub trait ReadPlusSeek: Read + Seek {}
impl<T: Read + Seek> ReadPlusSeek for T {}

/// fs2's flock wrappers on Unix are thin wrappers around flock(2), and in
/// particular don't handle EINTR.
pub fn retry_interrupted<F>(mut f: F) -> std::io::Result<()>
where
    F: FnMut() -> std::io::Result<()>,
{
    loop {
        match f() {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

/// Append a literal suffix to the last path component, e.g.
/// `nodes/ab/cd/<id>` + `.meta` -> `nodes/ab/cd/<id>.meta`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    os.into()
}

pub enum LockMode {
    Exclusive,
    Shared,
}

/// Acquire an advisory flock on `lock_path`, creating the file (and its
/// parent directories) if necessary.
///
/// On Unix the lock is released when the returned handle is dropped.
pub fn flock(lock_path: &Path, mode: LockMode) -> Result<File> {
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut open_options = fs::OpenOptions::new();
    // The lock file must be opened in write mode -- append mode isn't good
    // enough for flock on some platforms.
    open_options.write(true).create(true);
    let file = open_options.open(lock_path)?;
    match mode {
        LockMode::Shared => retry_interrupted(|| file.lock_shared())?,
        LockMode::Exclusive => retry_interrupted(|| file.lock_exclusive())?,
    }
    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("a/b/c"), ".meta"),
            PathBuf::from("a/b/c.meta")
        );
    }

    #[test]
    fn test_flock_creates_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/x.lock");
        let first = flock(&path, LockMode::Exclusive).unwrap();
        assert!(path.exists());
        drop(first);
        // shared locks coexist
        let _s1 = flock(&path, LockMode::Shared).unwrap();
        let _s2 = flock(&path, LockMode::Shared).unwrap();
    }
}
